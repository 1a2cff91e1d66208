//! Repository for the `render_jobs` table.
//!
//! One row per patch note, written with optimistic concurrency: updates
//! name the version they read and match zero rows when they lost the
//! race. Interpreting a zero-row update is the store wrapper's job.

use sqlx::PgPool;

use patchcast_core::render::RenderJob;
use patchcast_core::types::DbId;

use crate::models::render_job::{RenderJobRow, StateColumns};

/// Column list for `render_jobs` queries.
const COLUMNS: &str = "\
    patch_note_id, state_id, render_id, bucket_name, progress, \
    result_url, error_message, prior_result_url, \
    version, created_at, updated_at";

/// Provides row-level operations for render jobs.
pub struct RenderJobRepo;

impl RenderJobRepo {
    /// Find a job row by patch note id.
    pub async fn find(
        pool: &PgPool,
        patch_note_id: DbId,
    ) -> Result<Option<RenderJobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM render_jobs WHERE patch_note_id = $1");
        sqlx::query_as::<_, RenderJobRow>(&query)
            .bind(patch_note_id)
            .fetch_optional(pool)
            .await
    }

    /// Insert a brand-new job row at version 1.
    ///
    /// Fails with a unique violation if a row already exists for the
    /// patch note.
    pub async fn insert(pool: &PgPool, job: &RenderJob) -> Result<RenderJobRow, sqlx::Error> {
        let cols = StateColumns::from_state(&job.state);
        let query = format!(
            "INSERT INTO render_jobs \
                 (patch_note_id, state_id, render_id, bucket_name, progress, \
                  result_url, error_message, prior_result_url, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, RenderJobRow>(&query)
            .bind(job.patch_note_id)
            .bind(cols.state_id)
            .bind(cols.render_id)
            .bind(cols.bucket_name)
            .bind(cols.progress)
            .bind(cols.result_url)
            .bind(cols.error_message)
            .bind(&job.prior_result_url)
            .fetch_one(pool)
            .await
    }

    /// Versioned write: persist `job` only if the stored version equals
    /// `expected_version`.
    ///
    /// Returns `None` when no row matched -- either the row is gone or a
    /// newer writer got there first.
    pub async fn update_versioned(
        pool: &PgPool,
        job: &RenderJob,
        expected_version: i64,
    ) -> Result<Option<RenderJobRow>, sqlx::Error> {
        let cols = StateColumns::from_state(&job.state);
        let query = format!(
            "UPDATE render_jobs \
             SET state_id = $3, render_id = $4, bucket_name = $5, progress = $6, \
                 result_url = $7, error_message = $8, prior_result_url = $9, \
                 version = version + 1, updated_at = NOW() \
             WHERE patch_note_id = $1 AND version = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, RenderJobRow>(&query)
            .bind(job.patch_note_id)
            .bind(expected_version)
            .bind(cols.state_id)
            .bind(cols.render_id)
            .bind(cols.bucket_name)
            .bind(cols.progress)
            .bind(cols.result_url)
            .bind(cols.error_message)
            .bind(&job.prior_result_url)
            .fetch_optional(pool)
            .await
    }
}
