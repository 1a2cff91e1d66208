//! REST API client for the Remotion render service endpoints.
//!
//! Wraps render submission and progress retrieval using [`reqwest`] and
//! maps transport failures onto the orchestrator's transient/fatal error
//! taxonomy.

use async_trait::async_trait;
use serde::Deserialize;

use patchcast_core::gateway::{GatewayError, RenderGateway};
use patchcast_core::render::{ExternalJobRef, ProgressSnapshot, RenderParameters};
use patchcast_core::types::DbId;

/// HTTP client for a single render service instance.
pub struct RemotionClient {
    client: reqwest::Client,
    base_url: String,
}

/// Response returned by `POST /renders` after a render is queued.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued render.
    pub render_id: String,
    /// Storage bucket the service renders into.
    pub bucket_name: String,
}

/// Response returned by `GET /renders/{render_id}/progress`.
#[derive(Debug, Deserialize)]
pub struct ProgressResponse {
    /// Overall progress as a fraction in `0.0..=1.0`.
    #[serde(default)]
    pub overall_progress: f64,
    /// Whether the render has finished.
    #[serde(default)]
    pub done: bool,
    /// Unrecoverable error reported by the render itself.
    #[serde(default)]
    pub fatal_error: Option<String>,
    /// Location of the finished video, set once `done` is true.
    #[serde(default)]
    pub output_file: Option<String>,
}

impl From<ProgressResponse> for ProgressSnapshot {
    fn from(resp: ProgressResponse) -> Self {
        let percent = (resp.overall_progress * 100.0).round().clamp(0.0, 100.0) as u8;
        ProgressSnapshot {
            percent,
            done: resp.done,
            fatal_error: resp.fatal_error,
            output_url: resp.output_file,
        }
    }
}

/// Errors from the render service REST layer.
#[derive(Debug, thiserror::Error)]
pub enum RemotionApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The render service returned a non-2xx status code.
    #[error("render service error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl From<RemotionApiError> for GatewayError {
    fn from(err: RemotionApiError) -> Self {
        match err {
            // Decode failures mean we are talking to the wrong thing;
            // retrying will not fix that.
            RemotionApiError::Request(e) if e.is_decode() => GatewayError::Fatal(e.to_string()),
            RemotionApiError::Request(e) => GatewayError::Transient(e.to_string()),
            RemotionApiError::ApiError { status, ref body } if status >= 500 => {
                GatewayError::Transient(format!("render service returned {status}: {body}"))
            }
            RemotionApiError::ApiError { status, body } => {
                GatewayError::Fatal(format!("render service returned {status}: {body}"))
            }
        }
    }
}

impl RemotionClient {
    /// Create a new client for a render service instance.
    ///
    /// * `base_url` - Base HTTP URL, e.g. `http://localhost:3001`.
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Create a client reusing an existing [`reqwest::Client`] (useful
    /// for connection pooling).
    pub fn with_client(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    /// Queue a render.
    ///
    /// Sends `POST /renders` with the composition, its input props, and
    /// the patch note id the service tags its output with.
    pub async fn submit_render(
        &self,
        patch_note_id: DbId,
        params: &RenderParameters,
    ) -> Result<SubmitResponse, RemotionApiError> {
        let body = serde_json::json!({
            "patch_note_id": patch_note_id,
            "composition": params.composition,
            "input_props": params.input_props,
        });

        let response = self
            .client
            .post(format!("{}/renders", self.base_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch progress for a queued or running render.
    ///
    /// Sends `GET /renders/{render_id}/progress?bucket={bucket_name}`.
    pub async fn render_progress(
        &self,
        external: &ExternalJobRef,
    ) -> Result<ProgressResponse, RemotionApiError> {
        let response = self
            .client
            .get(format!(
                "{}/renders/{}/progress",
                self.base_url, external.render_id
            ))
            .query(&[("bucket", external.bucket_name.as_str())])
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code, then parse the JSON
    /// body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemotionApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(RemotionApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl RenderGateway for RemotionClient {
    async fn submit(
        &self,
        patch_note_id: DbId,
        params: &RenderParameters,
    ) -> Result<ExternalJobRef, GatewayError> {
        let response = self.submit_render(patch_note_id, params).await?;

        tracing::info!(
            patch_note_id,
            render_id = %response.render_id,
            bucket = %response.bucket_name,
            "Render queued on render service",
        );

        Ok(ExternalJobRef {
            render_id: response.render_id,
            bucket_name: response.bucket_name,
        })
    }

    async fn poll(&self, external: &ExternalJobRef) -> Result<ProgressSnapshot, GatewayError> {
        let response = self.render_progress(external).await?;
        Ok(response.into())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_progress(json: &str) -> ProgressSnapshot {
        serde_json::from_str::<ProgressResponse>(json).unwrap().into()
    }

    #[test]
    fn progress_fraction_maps_to_percent() {
        let snapshot = parse_progress(r#"{"overall_progress": 0.45, "done": false}"#);
        assert_eq!(snapshot.percent, 45);
        assert!(!snapshot.done);
        assert!(snapshot.fatal_error.is_none());
    }

    #[test]
    fn progress_rounds_and_clamps() {
        assert_eq!(parse_progress(r#"{"overall_progress": 0.996}"#).percent, 100);
        assert_eq!(parse_progress(r#"{"overall_progress": 1.7}"#).percent, 100);
        assert_eq!(parse_progress(r#"{"overall_progress": -0.2}"#).percent, 0);
    }

    #[test]
    fn done_response_carries_output() {
        let snapshot = parse_progress(
            r#"{"overall_progress": 1.0, "done": true, "output_file": "s3://renders/x.mp4"}"#,
        );
        assert!(snapshot.done);
        assert_eq!(snapshot.output_url.as_deref(), Some("s3://renders/x.mp4"));
    }

    #[test]
    fn fatal_error_passes_through() {
        let snapshot = parse_progress(
            r#"{"overall_progress": 0.1, "done": false, "fatal_error": "composition crashed"}"#,
        );
        assert_eq!(snapshot.fatal_error.as_deref(), Some("composition crashed"));
    }

    #[test]
    fn missing_fields_default() {
        let snapshot = parse_progress("{}");
        assert_eq!(snapshot.percent, 0);
        assert!(!snapshot.done);
        assert!(snapshot.output_url.is_none());
    }

    #[test]
    fn server_errors_are_transient() {
        let err = RemotionApiError::ApiError {
            status: 503,
            body: "overloaded".to_string(),
        };
        assert!(matches!(GatewayError::from(err), GatewayError::Transient(_)));
    }

    #[test]
    fn client_errors_are_fatal() {
        let err = RemotionApiError::ApiError {
            status: 404,
            body: "unknown render".to_string(),
        };
        assert!(matches!(GatewayError::from(err), GatewayError::Fatal(_)));
    }
}
