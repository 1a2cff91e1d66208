use std::sync::Arc;

use patchcast_orchestrator::Orchestrator;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via
/// `State<AppState>`.
///
/// Cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: patchcast_db::DbPool,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Render orchestrator (idempotency guard + reconciliation loops).
    pub orchestrator: Arc<Orchestrator>,
}
