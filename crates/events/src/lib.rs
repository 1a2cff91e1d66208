//! Patchcast render status fan-out.
//!
//! This crate provides [`StatusBroadcaster`], the per-patch-note
//! publish/subscribe hub between the render reconciliation loops and any
//! number of connected status-stream clients.

pub mod broadcaster;

pub use broadcaster::{StatusBroadcaster, StatusReceiver};
