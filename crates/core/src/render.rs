//! Render job model and state machine.
//!
//! A [`RenderJob`] tracks one patch note's video render through
//! `Idle -> Queued -> Rendering -> {Completed | Failed}`. The state is a
//! tagged union so that fields like `progress` or `result_url` only exist
//! in the states where they mean something. All transition rules live in
//! [`RenderJob::apply`]; persisting and broadcasting the result is the
//! orchestrator's job.

use serde::{Deserialize, Serialize};

use crate::types::{DbId, Timestamp};

/// Error message recorded when the reconciliation deadline expires.
pub const TIMEOUT_ERROR: &str = "timeout";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Opaque handles issued by the render service for one queued render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalJobRef {
    /// Server-assigned render identifier.
    pub render_id: String,
    /// Storage bucket the service writes its output into.
    pub bucket_name: String,
}

/// One progress report returned by the render service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Overall progress, `0..=100`.
    pub percent: u8,
    /// Whether the render has finished (successfully or not).
    pub done: bool,
    /// Unrecoverable error reported by the render itself.
    pub fatal_error: Option<String>,
    /// Location of the finished video. Set together with `done`.
    pub output_url: Option<String>,
}

/// Parameters forwarded verbatim to the render service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderParameters {
    /// Composition the service should render.
    pub composition: String,
    /// Free-form props passed into the composition.
    #[serde(default)]
    pub input_props: serde_json::Value,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Render lifecycle state.
///
/// Discriminant and payload travel together, so illegal combinations (a
/// result URL on a failed job, progress without a render id) are
/// unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RenderState {
    /// No render has been submitted for this generation yet.
    Idle,
    /// Submission accepted by the render service; no progress seen yet.
    Queued { external: ExternalJobRef },
    /// The service has reported at least one progress snapshot.
    Rendering { external: ExternalJobRef, progress: u8 },
    /// Terminal: the finished video is available at `result_url`.
    Completed { result_url: String },
    /// Terminal: the render failed; `error` is human-readable.
    Failed { error: String },
}

impl RenderState {
    /// Lower-case state name, matching the serialized `state` tag.
    pub fn name(&self) -> &'static str {
        match self {
            RenderState::Idle => "idle",
            RenderState::Queued { .. } => "queued",
            RenderState::Rendering { .. } => "rendering",
            RenderState::Completed { .. } => "completed",
            RenderState::Failed { .. } => "failed",
        }
    }

    /// Whether this state admits no further transitions within its
    /// generation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RenderState::Completed { .. } | RenderState::Failed { .. }
        )
    }

    /// Progress percentage, where meaningful.
    pub fn progress(&self) -> Option<u8> {
        match self {
            RenderState::Rendering { progress, .. } => Some(*progress),
            RenderState::Completed { .. } => Some(100),
            _ => None,
        }
    }

    /// The external job handle, present while a render is in flight.
    pub fn external(&self) -> Option<&ExternalJobRef> {
        match self {
            RenderState::Queued { external } | RenderState::Rendering { external, .. } => {
                Some(external)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events consumed by the state machine.
#[derive(Debug, Clone)]
pub enum RenderEvent {
    /// The render service accepted the first submission for this job.
    SubmitAccepted { external: ExternalJobRef },
    /// A polled progress snapshot.
    Snapshot(ProgressSnapshot),
    /// The reconciliation loop exceeded its wall-clock deadline.
    DeadlineExceeded,
    /// A new generation starts over from a finished (or orphaned) one.
    NewGeneration { external: ExternalJobRef },
}

impl RenderEvent {
    fn name(&self) -> &'static str {
        match self {
            RenderEvent::SubmitAccepted { .. } => "submit_accepted",
            RenderEvent::Snapshot(_) => "snapshot",
            RenderEvent::DeadlineExceeded => "deadline_exceeded",
            RenderEvent::NewGeneration { .. } => "new_generation",
        }
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event {event} is not valid in state {state}")]
pub struct TransitionError {
    /// State the job was in when the event arrived.
    pub state: &'static str,
    /// The rejected event.
    pub event: &'static str,
}

// ---------------------------------------------------------------------------
// RenderJob
// ---------------------------------------------------------------------------

/// One patch note's render job: current state plus the bookkeeping that
/// spans generations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderJob {
    /// Identity of the patch note being rendered; primary key.
    pub patch_note_id: DbId,
    /// Current lifecycle state.
    #[serde(flatten)]
    pub state: RenderState,
    /// Result of the previous completed generation, kept readable while a
    /// forced re-render is in flight. Cleared when a new result lands.
    pub prior_result_url: Option<String>,
    /// Optimistic-concurrency version; bumped by every persisted write.
    pub version: i64,
    /// Last mutation time (UTC).
    pub updated_at: Timestamp,
}

impl RenderJob {
    /// Fresh, never-submitted job for a patch note.
    pub fn new(patch_note_id: DbId) -> Self {
        Self {
            patch_note_id,
            state: RenderState::Idle,
            prior_result_url: None,
            version: 0,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Whether the current generation is finished.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The result URL a caller may read right now: the current
    /// generation's if completed, otherwise the previous generation's.
    pub fn available_result_url(&self) -> Option<&str> {
        match &self.state {
            RenderState::Completed { result_url } => Some(result_url),
            _ => self.prior_result_url.as_deref(),
        }
    }

    /// Apply `event` to the job.
    ///
    /// Returns `Ok(true)` when the job changed and must be persisted and
    /// broadcast, `Ok(false)` when the event was a stale or duplicate
    /// snapshot that is discarded for monotonicity, and an error when the
    /// event is not legal in the current state.
    ///
    /// The transition table:
    ///
    /// | From             | Event             | To          |
    /// |------------------|-------------------|-------------|
    /// | Idle             | SubmitAccepted    | Queued      |
    /// | Queued           | Snapshot          | Rendering / Completed / Failed |
    /// | Rendering        | Snapshot          | Rendering / Completed / Failed |
    /// | Queued/Rendering | DeadlineExceeded  | Failed      |
    /// | any but Idle     | NewGeneration     | Queued      |
    ///
    /// `NewGeneration` from a non-terminal state covers re-submission over
    /// a generation orphaned by a process restart; the orchestrator's
    /// registry guarantees the orphan's loop is gone.
    pub fn apply(&mut self, event: &RenderEvent) -> Result<bool, TransitionError> {
        let next = match (&self.state, event) {
            (RenderState::Idle, RenderEvent::SubmitAccepted { external }) => {
                RenderState::Queued {
                    external: external.clone(),
                }
            }

            (RenderState::Queued { external }, RenderEvent::Snapshot(snapshot)) => {
                match resolve_snapshot(snapshot) {
                    SnapshotOutcome::Progress(percent) => RenderState::Rendering {
                        external: external.clone(),
                        progress: percent,
                    },
                    SnapshotOutcome::Completed(url) => RenderState::Completed { result_url: url },
                    SnapshotOutcome::Failed(error) => RenderState::Failed { error },
                }
            }

            (
                RenderState::Rendering { external, progress },
                RenderEvent::Snapshot(snapshot),
            ) => match resolve_snapshot(snapshot) {
                // A lower or equal percentage is a stale report; discard it.
                SnapshotOutcome::Progress(percent) if percent <= *progress => return Ok(false),
                SnapshotOutcome::Progress(percent) => RenderState::Rendering {
                    external: external.clone(),
                    progress: percent,
                },
                SnapshotOutcome::Completed(url) => RenderState::Completed { result_url: url },
                SnapshotOutcome::Failed(error) => RenderState::Failed { error },
            },

            (
                RenderState::Queued { .. } | RenderState::Rendering { .. },
                RenderEvent::DeadlineExceeded,
            ) => RenderState::Failed {
                error: TIMEOUT_ERROR.to_string(),
            },

            (state, RenderEvent::NewGeneration { external }) if !matches!(state, RenderState::Idle) => {
                RenderState::Queued {
                    external: external.clone(),
                }
            }

            (state, event) => {
                return Err(TransitionError {
                    state: state.name(),
                    event: event.name(),
                })
            }
        };

        // Keep the previous result readable while the replacement renders;
        // a fresh result supersedes it.
        match (&self.state, &next) {
            (RenderState::Completed { result_url }, _) => {
                self.prior_result_url = Some(result_url.clone());
            }
            (_, RenderState::Completed { .. }) => {
                self.prior_result_url = None;
            }
            _ => {}
        }

        self.state = next;
        self.updated_at = chrono::Utc::now();
        Ok(true)
    }
}

/// What a single snapshot means for the state machine.
enum SnapshotOutcome {
    Progress(u8),
    Completed(String),
    Failed(String),
}

/// Collapse a snapshot into its outcome. A fatal error always wins; a
/// `done` report wins regardless of its percentage.
fn resolve_snapshot(snapshot: &ProgressSnapshot) -> SnapshotOutcome {
    if let Some(error) = &snapshot.fatal_error {
        return SnapshotOutcome::Failed(error.clone());
    }
    if snapshot.done {
        return match &snapshot.output_url {
            Some(url) => SnapshotOutcome::Completed(url.clone()),
            None => SnapshotOutcome::Failed(
                "render finished without an output location".to_string(),
            ),
        };
    }
    SnapshotOutcome::Progress(snapshot.percent.min(100))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
