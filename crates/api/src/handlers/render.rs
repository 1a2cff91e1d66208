//! Handlers for patch-note render operations.
//!
//! The submission endpoint maps the orchestrator's idempotency decision
//! onto HTTP; the WebSocket endpoint exposes the status stream: ordered
//! job snapshots, heartbeat pings while idle, and a server-initiated
//! close after the terminal snapshot.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use patchcast_core::error::CoreError;
use patchcast_core::render::RenderParameters;
use patchcast_core::render_events::MSG_TYPE_RENDER_STATUS;
use patchcast_core::types::DbId;
use patchcast_events::StatusReceiver;
use patchcast_orchestrator::RenderDecision;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Body for `POST /patch-notes/{id}/render`.
#[derive(Debug, Deserialize)]
pub struct StartRenderRequest {
    /// Render parameters forwarded to the render service.
    pub parameters: RenderParameters,
    /// Start a new render even if a finished one exists.
    #[serde(default)]
    pub force: bool,
}

/// Idempotency decision returned by the submission endpoint.
#[derive(Debug, Serialize)]
pub struct RenderDecisionResponse {
    /// `"reuse"`, `"attach"`, or `"started"`.
    pub decision: &'static str,
    /// Existing video location; only set for `"reuse"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/patch-notes/{id}/render
///
/// Returns 200 with the existing result when it can be reused, 202 when
/// the caller should attach to an in-flight render or a new one was
/// started, and 409 when `force` is requested while a render is active.
pub async fn start_render(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<StartRenderRequest>,
) -> AppResult<impl IntoResponse> {
    if input.parameters.composition.trim().is_empty() {
        return Err(AppError::BadRequest(
            "composition must not be empty".to_string(),
        ));
    }

    let decision = state
        .orchestrator
        .start_render(id, input.parameters, input.force)
        .await?;

    tracing::info!(patch_note_id = id, decision = ?decision, "Render request handled");

    let (status, body) = match decision {
        RenderDecision::Reuse { result_url } => (
            StatusCode::OK,
            RenderDecisionResponse {
                decision: "reuse",
                result_url: Some(result_url),
            },
        ),
        RenderDecision::Attach => (
            StatusCode::ACCEPTED,
            RenderDecisionResponse {
                decision: "attach",
                result_url: None,
            },
        ),
        RenderDecision::Started => (
            StatusCode::ACCEPTED,
            RenderDecisionResponse {
                decision: "started",
                result_url: None,
            },
        ),
    };
    Ok((status, Json(DataResponse { data: body })))
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// GET /api/v1/patch-notes/{id}/render
///
/// Current persisted render job for the patch note.
pub async fn get_render(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = state
        .orchestrator
        .job(id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "RenderJob",
            id,
        }))?;

    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Status stream
// ---------------------------------------------------------------------------

/// GET /api/v1/patch-notes/{id}/render/ws
///
/// Upgrade to a WebSocket status stream. Subscribing happens before the
/// upgrade so an unknown patch note still fails as a plain 404.
pub async fn status_stream(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let receiver = state.orchestrator.subscribe(id).await?;
    let heartbeat = Duration::from_secs(state.config.ws_heartbeat_secs);

    Ok(ws.on_upgrade(move |socket| stream_status(socket, id, receiver, heartbeat)))
}

/// Forward job snapshots to one WebSocket client until the job reaches a
/// terminal state or the client goes away.
async fn stream_status(
    socket: WebSocket,
    patch_note_id: DbId,
    mut receiver: StatusReceiver,
    heartbeat: Duration,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, patch_note_id, "Render status stream connected");

    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval(heartbeat);
    // An interval's first tick completes immediately; skip it so the
    // first frame on the wire is the job snapshot, not a ping.
    ping.tick().await;

    loop {
        tokio::select! {
            update = receiver.recv() => match update {
                Some(job) => {
                    let payload = serde_json::json!({
                        "type": MSG_TYPE_RENDER_STATUS,
                        "job": job,
                    });
                    if sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Terminal snapshot delivered; the server closes.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // Pongs and stray client messages are ignored.
                }
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "Render status stream receive error");
                    break;
                }
            }
        }
    }

    // Dropping the receiver unsubscribes from the broadcaster.
    tracing::info!(conn_id = %conn_id, patch_note_id, "Render status stream disconnected");
}
