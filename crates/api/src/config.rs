//! Server configuration loaded from environment variables.

use patchcast_orchestrator::RenderTimings;

/// Server configuration.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`). Does not apply
    /// to WebSocket status streams.
    pub request_timeout_secs: u64,
    /// Interval between WebSocket heartbeat pings in seconds
    /// (default: `30`). Keeps status streams alive through proxies that
    /// drop idle connections.
    pub ws_heartbeat_secs: u64,
    /// Base URL of the Remotion render service.
    pub render_service_url: String,
    /// Render orchestration timings (poll interval, deadline, retries).
    pub timings: RenderTimings,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                  |
    /// |------------------------|--------------------------|
    /// | `HOST`                 | `0.0.0.0`                |
    /// | `PORT`                 | `3000`                   |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`  |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                     |
    /// | `WS_HEARTBEAT_SECS`    | `30`                     |
    /// | `RENDER_SERVICE_URL`   | `http://localhost:3001`  |
    ///
    /// Render timing variables are documented on
    /// [`RenderTimings::from_env`].
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let ws_heartbeat_secs: u64 = std::env::var("WS_HEARTBEAT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("WS_HEARTBEAT_SECS must be a valid u64");

        let render_service_url = std::env::var("RENDER_SERVICE_URL")
            .unwrap_or_else(|_| "http://localhost:3001".into());

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            ws_heartbeat_secs,
            render_service_url,
            timings: RenderTimings::from_env(),
        }
    }
}
