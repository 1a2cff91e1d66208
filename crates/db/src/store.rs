//! Postgres implementation of the render job store seam.

use async_trait::async_trait;

use patchcast_core::render::RenderJob;
use patchcast_core::store::{RenderJobStore, StoreError};
use patchcast_core::types::DbId;

use crate::models::render_job::RenderJobRow;
use crate::repositories::RenderJobRepo;
use crate::DbPool;

/// [`RenderJobStore`] backed by the `render_jobs` table.
pub struct PgRenderJobStore {
    pool: DbPool,
}

impl PgRenderJobStore {
    /// Wrap a connection pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RenderJobStore for PgRenderJobStore {
    async fn find(&self, patch_note_id: DbId) -> Result<Option<RenderJob>, StoreError> {
        RenderJobRepo::find(&self.pool, patch_note_id)
            .await
            .map_err(backend)?
            .map(into_domain)
            .transpose()
    }

    async fn insert(&self, job: &RenderJob) -> Result<RenderJob, StoreError> {
        match RenderJobRepo::insert(&self.pool, job).await {
            Ok(row) => into_domain(row),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict {
                patch_note_id: job.patch_note_id,
            }),
            Err(e) => Err(backend(e)),
        }
    }

    async fn update(
        &self,
        job: &RenderJob,
        expected_version: i64,
    ) -> Result<RenderJob, StoreError> {
        let updated = RenderJobRepo::update_versioned(&self.pool, job, expected_version)
            .await
            .map_err(backend)?;

        match updated {
            Some(row) => into_domain(row),
            // Zero rows matched: distinguish a lost race from a missing row.
            None => match RenderJobRepo::find(&self.pool, job.patch_note_id)
                .await
                .map_err(backend)?
            {
                Some(_) => Err(StoreError::Conflict {
                    patch_note_id: job.patch_note_id,
                }),
                None => Err(StoreError::NotFound {
                    patch_note_id: job.patch_note_id,
                }),
            },
        }
    }
}

fn into_domain(row: RenderJobRow) -> Result<RenderJob, StoreError> {
    row.into_domain().map_err(|e| StoreError::Backend(e.to_string()))
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// PostgreSQL unique constraint violation (error code 23505).
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    )
}
