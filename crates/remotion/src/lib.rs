//! HTTP client for the Remotion render service.
//!
//! The dashboard delegates video rendering to a separate Remotion-based
//! service. This crate wraps its two endpoints (queue a render, fetch
//! render progress) with [`reqwest`] and adapts them to the
//! [`RenderGateway`](patchcast_core::gateway::RenderGateway) seam the
//! orchestrator polls against.

pub mod client;

pub use client::{RemotionClient, RemotionApiError};
