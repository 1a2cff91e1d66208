//! Persistence seam for render jobs.
//!
//! The store is the single source of truth for a job's state: every
//! transition is written through it before anyone else may observe the
//! change. Writers use optimistic concurrency -- an update names the
//! version it read, and loses with [`StoreError::Conflict`] if the row
//! moved underneath it.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::render::RenderJob;
use crate::types::DbId;

/// Errors from a [`RenderJobStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A versioned write lost its race: the stored row is newer than the
    /// version the writer read.
    #[error("concurrent modification of render job {patch_note_id}")]
    Conflict {
        /// Key of the contested row.
        patch_note_id: DbId,
    },

    /// A versioned write targeted a row that does not exist.
    #[error("render job {patch_note_id} not found")]
    NotFound {
        /// Key of the missing row.
        patch_note_id: DbId,
    },

    /// The backing store failed.
    #[error("store error: {0}")]
    Backend(String),
}

/// Row store keyed by patch note id.
///
/// Implementations assign versions: `insert` stores version 1, `update`
/// stores `expected_version + 1`. The returned job always carries the
/// version that was actually persisted.
#[async_trait]
pub trait RenderJobStore: Send + Sync {
    /// Load the current row for a patch note, if any.
    async fn find(&self, patch_note_id: DbId) -> Result<Option<RenderJob>, StoreError>;

    /// Insert a brand-new row. Fails with [`StoreError::Conflict`] if a
    /// row already exists for the patch note.
    async fn insert(&self, job: &RenderJob) -> Result<RenderJob, StoreError>;

    /// Write `job` only if the stored version equals `expected_version`.
    async fn update(
        &self,
        job: &RenderJob,
        expected_version: i64,
    ) -> Result<RenderJob, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory [`RenderJobStore`] with the same versioning semantics as the
/// Postgres implementation. Used by the orchestrator's test-suite and for
/// running the stack without a database.
#[derive(Default)]
pub struct MemoryRenderJobStore {
    jobs: Mutex<HashMap<DbId, RenderJob>>,
}

impl MemoryRenderJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RenderJobStore for MemoryRenderJobStore {
    async fn find(&self, patch_note_id: DbId) -> Result<Option<RenderJob>, StoreError> {
        Ok(self.jobs.lock().await.get(&patch_note_id).cloned())
    }

    async fn insert(&self, job: &RenderJob) -> Result<RenderJob, StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.patch_note_id) {
            return Err(StoreError::Conflict {
                patch_note_id: job.patch_note_id,
            });
        }
        let mut stored = job.clone();
        stored.version = 1;
        jobs.insert(job.patch_note_id, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        job: &RenderJob,
        expected_version: i64,
    ) -> Result<RenderJob, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let current = jobs
            .get(&job.patch_note_id)
            .ok_or(StoreError::NotFound {
                patch_note_id: job.patch_note_id,
            })?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                patch_note_id: job.patch_note_id,
            });
        }
        let mut stored = job.clone();
        stored.version = expected_version + 1;
        jobs.insert(job.patch_note_id, stored.clone());
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn insert_assigns_version_one() {
        let store = MemoryRenderJobStore::new();
        let stored = store.insert(&RenderJob::new(7)).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(store.find(7).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn double_insert_conflicts() {
        let store = MemoryRenderJobStore::new();
        store.insert(&RenderJob::new(7)).await.unwrap();
        assert_matches!(
            store.insert(&RenderJob::new(7)).await,
            Err(StoreError::Conflict { patch_note_id: 7 })
        );
    }

    #[tokio::test]
    async fn update_bumps_version() {
        let store = MemoryRenderJobStore::new();
        let stored = store.insert(&RenderJob::new(7)).await.unwrap();
        let stored = store.update(&stored, stored.version).await.unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemoryRenderJobStore::new();
        let v1 = store.insert(&RenderJob::new(7)).await.unwrap();
        store.update(&v1, 1).await.unwrap();

        // A second writer still holding version 1 must lose.
        assert_matches!(
            store.update(&v1, 1).await,
            Err(StoreError::Conflict { patch_note_id: 7 })
        );
    }

    #[tokio::test]
    async fn update_missing_row_is_not_found() {
        let store = MemoryRenderJobStore::new();
        assert_matches!(
            store.update(&RenderJob::new(9), 1).await,
            Err(StoreError::NotFound { patch_note_id: 9 })
        );
    }
}
