//! Row model for the `render_jobs` table.
//!
//! The table stores the state tagged union as a status id plus one
//! nullable column per payload field. The nullable-column combination is
//! validated exactly once, in [`RenderJobRow::into_domain`] -- everything
//! past that boundary works with the tagged union and cannot observe an
//! illegal shape.

use serde::Serialize;
use sqlx::FromRow;

use patchcast_core::error::CoreError;
use patchcast_core::render::{ExternalJobRef, RenderJob, RenderState};
use patchcast_core::types::{DbId, Timestamp};

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

/// Render lifecycle status, matching the `state_id` column values.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStateId {
    Idle = 1,
    Queued = 2,
    Rendering = 3,
    Completed = 4,
    Failed = 5,
}

impl RenderStateId {
    /// Return the database status ID.
    pub fn id(self) -> StatusId {
        self as StatusId
    }

    /// Map a raw column value back to the enum.
    pub fn try_from_id(id: StatusId) -> Option<Self> {
        match id {
            1 => Some(RenderStateId::Idle),
            2 => Some(RenderStateId::Queued),
            3 => Some(RenderStateId::Rendering),
            4 => Some(RenderStateId::Completed),
            5 => Some(RenderStateId::Failed),
            _ => None,
        }
    }

    /// The status id for a domain state.
    pub fn from_state(state: &RenderState) -> Self {
        match state {
            RenderState::Idle => RenderStateId::Idle,
            RenderState::Queued { .. } => RenderStateId::Queued,
            RenderState::Rendering { .. } => RenderStateId::Rendering,
            RenderState::Completed { .. } => RenderStateId::Completed,
            RenderState::Failed { .. } => RenderStateId::Failed,
        }
    }
}

/// A row from the `render_jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RenderJobRow {
    pub patch_note_id: DbId,
    pub state_id: StatusId,
    pub render_id: Option<String>,
    pub bucket_name: Option<String>,
    pub progress: i16,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub prior_result_url: Option<String>,
    pub version: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Per-state column values, used when binding writes.
pub struct StateColumns {
    pub state_id: StatusId,
    pub render_id: Option<String>,
    pub bucket_name: Option<String>,
    pub progress: i16,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
}

impl StateColumns {
    /// Flatten a domain state into its column values.
    pub fn from_state(state: &RenderState) -> Self {
        let mut cols = Self {
            state_id: RenderStateId::from_state(state).id(),
            render_id: None,
            bucket_name: None,
            progress: 0,
            result_url: None,
            error_message: None,
        };
        match state {
            RenderState::Idle => {}
            RenderState::Queued { external } => {
                cols.render_id = Some(external.render_id.clone());
                cols.bucket_name = Some(external.bucket_name.clone());
            }
            RenderState::Rendering { external, progress } => {
                cols.render_id = Some(external.render_id.clone());
                cols.bucket_name = Some(external.bucket_name.clone());
                cols.progress = *progress as i16;
            }
            RenderState::Completed { result_url } => {
                cols.progress = 100;
                cols.result_url = Some(result_url.clone());
            }
            RenderState::Failed { error } => {
                cols.error_message = Some(error.clone());
            }
        }
        cols
    }
}

impl RenderJobRow {
    /// Validate the nullable-column combination and build the domain
    /// value. Fails on rows with an illegal shape.
    pub fn into_domain(self) -> Result<RenderJob, CoreError> {
        let patch_note_id = self.patch_note_id;
        let state_id = RenderStateId::try_from_id(self.state_id)
            .ok_or_else(|| corrupt(patch_note_id, format!("unknown state_id {}", self.state_id)))?;

        let state = match state_id {
            RenderStateId::Idle => RenderState::Idle,
            RenderStateId::Queued => RenderState::Queued {
                external: external_ref(patch_note_id, self.render_id, self.bucket_name)?,
            },
            RenderStateId::Rendering => {
                if !(0..=100).contains(&self.progress) {
                    return Err(corrupt(
                        patch_note_id,
                        format!("progress {} out of range", self.progress),
                    ));
                }
                RenderState::Rendering {
                    external: external_ref(patch_note_id, self.render_id, self.bucket_name)?,
                    progress: self.progress as u8,
                }
            }
            RenderStateId::Completed => RenderState::Completed {
                result_url: self
                    .result_url
                    .ok_or_else(|| corrupt(patch_note_id, "completed without result_url".into()))?,
            },
            RenderStateId::Failed => RenderState::Failed {
                error: self
                    .error_message
                    .ok_or_else(|| corrupt(patch_note_id, "failed without error_message".into()))?,
            },
        };

        Ok(RenderJob {
            patch_note_id,
            state,
            prior_result_url: self.prior_result_url,
            version: self.version,
            updated_at: self.updated_at,
        })
    }
}

fn external_ref(
    patch_note_id: DbId,
    render_id: Option<String>,
    bucket_name: Option<String>,
) -> Result<ExternalJobRef, CoreError> {
    match (render_id, bucket_name) {
        (Some(render_id), Some(bucket_name)) => Ok(ExternalJobRef {
            render_id,
            bucket_name,
        }),
        _ => Err(corrupt(
            patch_note_id,
            "in-flight state without render handles".into(),
        )),
    }
}

fn corrupt(patch_note_id: DbId, detail: String) -> CoreError {
    CoreError::Internal(format!(
        "corrupt render job row for patch note {patch_note_id}: {detail}"
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
