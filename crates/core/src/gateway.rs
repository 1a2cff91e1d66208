//! Seam between the orchestrator and the external render service.

use async_trait::async_trait;

use crate::render::{ExternalJobRef, ProgressSnapshot, RenderParameters};
use crate::types::DbId;

/// Errors surfaced by a render gateway, split along the retry boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Network-level or service-side hiccup; safe to retry.
    #[error("transient render service error: {0}")]
    Transient(String),

    /// The service rejected the request outright. Not retryable.
    #[error("fatal render service error: {0}")]
    Fatal(String),
}

/// Client for the external rendering backend.
///
/// `submit` must be called at most once per job generation -- the
/// orchestrator's idempotency guard enforces that, not the gateway.
#[async_trait]
pub trait RenderGateway: Send + Sync {
    /// Queue a render for a patch note. Returns the service-issued
    /// handles needed to poll for progress.
    async fn submit(
        &self,
        patch_note_id: DbId,
        params: &RenderParameters,
    ) -> Result<ExternalJobRef, GatewayError>;

    /// Fetch the current progress of an in-flight render.
    ///
    /// A render that failed on the service side is reported through
    /// [`ProgressSnapshot::fatal_error`], not through [`GatewayError`].
    async fn poll(&self, external: &ExternalJobRef) -> Result<ProgressSnapshot, GatewayError>;
}
