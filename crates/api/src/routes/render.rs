//! Route definitions for patch-note render operations.

use axum::routing::get;
use axum::Router;

use crate::handlers::render;
use crate::state::AppState;

/// Routes mounted at `/patch-notes`.
///
/// ```text
/// GET    /{id}/render      -> get_render
/// POST   /{id}/render      -> start_render
/// GET    /{id}/render/ws   -> status_stream
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/{id}/render",
            get(render::get_render).post(render::start_render),
        )
        .route("/{id}/render/ws", get(render::status_stream))
}
