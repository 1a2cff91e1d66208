//! WebSocket message type constants for render status streams.
//!
//! Used by the API layer when pushing job snapshots to subscribed
//! clients.

/// A full render job snapshot (initial state and every transition).
pub const MSG_TYPE_RENDER_STATUS: &str = "render_status";
