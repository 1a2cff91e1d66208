//! Domain-level error type shared across the workspace.

use crate::types::DbId;

/// Domain errors surfaced by core logic and the orchestrator.
///
/// The API layer maps each variant onto an HTTP status code; see
/// `patchcast-api`'s error module.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// An entity lookup by id came up empty.
    #[error("{entity} with id {id} not found")]
    NotFound {
        /// Entity kind, e.g. `"RenderJob"`.
        entity: &'static str,
        /// The id that was looked up.
        id: DbId,
    },

    /// The request is structurally valid but violates a domain rule.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The request conflicts with the current state of the system.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An unexpected internal failure. The message is logged, not shown
    /// to API callers.
    #[error("Internal error: {0}")]
    Internal(String),
}
