//! Per-generation progress reconciliation loop.
//!
//! One [`ReconciliationLoop`] runs per active job generation -- never per
//! subscriber. It polls the render gateway at a fixed interval, applies
//! each snapshot to the state machine, writes every transition through
//! the store *before* broadcasting it, and exits after the first
//! terminal transition. Transient gateway failures are retried with
//! exponential backoff inside the loop and never reach subscribers
//! unless the retry budget runs out.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use patchcast_core::gateway::{GatewayError, RenderGateway};
use patchcast_core::render::{ExternalJobRef, ProgressSnapshot, RenderEvent, RenderJob};
use patchcast_core::store::{RenderJobStore, StoreError};
use patchcast_core::types::DbId;
use patchcast_events::StatusBroadcaster;

use crate::config::RenderTimings;

/// Registry of in-flight job generations, keyed by patch note id.
///
/// Presence of a key means a reconciliation loop (or the submission that
/// precedes it) owns that subject; the stored token cancels the loop.
pub(crate) type ActiveGenerations = Mutex<HashMap<DbId, CancellationToken>>;

/// State for one generation's polling task.
pub(crate) struct ReconciliationLoop {
    pub store: Arc<dyn RenderJobStore>,
    pub gateway: Arc<dyn RenderGateway>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub timings: RenderTimings,
    pub active: Arc<ActiveGenerations>,
    /// Working copy of the job, already persisted as `Queued`. The store,
    /// not this copy, is the source of truth -- every change is written
    /// through before anyone else observes it.
    pub job: RenderJob,
    pub external: ExternalJobRef,
    pub cancel: CancellationToken,
}

impl ReconciliationLoop {
    /// Poll until a terminal transition, the deadline, or cancellation,
    /// then deregister this generation.
    pub(crate) async fn run(mut self) {
        let patch_note_id = self.job.patch_note_id;
        let deadline = Instant::now() + self.timings.deadline;
        let mut failures: u32 = 0;
        let mut backoff = self.timings.backoff_initial;
        let mut wait = self.timings.poll_interval;

        tracing::debug!(
            patch_note_id,
            render_id = %self.external.render_id,
            "Reconciliation loop started",
        );

        loop {
            // Sleep for the poll interval (or the current backoff), but
            // never past the deadline.
            let sleep_for = wait.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!(patch_note_id, "Reconciliation loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    patch_note_id,
                    deadline_secs = self.timings.deadline.as_secs(),
                    "Render deadline exceeded",
                );
                self.apply_and_publish(RenderEvent::DeadlineExceeded).await;
                break;
            }

            match self.gateway.poll(&self.external).await {
                Ok(snapshot) => {
                    failures = 0;
                    backoff = self.timings.backoff_initial;
                    wait = self.timings.poll_interval;
                    if self.apply_and_publish(RenderEvent::Snapshot(snapshot)).await {
                        break;
                    }
                }
                Err(GatewayError::Fatal(cause)) => {
                    tracing::error!(
                        patch_note_id,
                        render_id = %self.external.render_id,
                        error = %cause,
                        "Render service reported a fatal error",
                    );
                    self.apply_and_publish(fail_event(cause)).await;
                    break;
                }
                Err(GatewayError::Transient(cause)) => {
                    failures += 1;
                    if failures > self.timings.max_transient_failures {
                        tracing::error!(
                            patch_note_id,
                            failures,
                            error = %cause,
                            "Render progress retry budget exhausted",
                        );
                        let event =
                            fail_event(format!("render service unreachable: {cause}"));
                        self.apply_and_publish(event).await;
                        break;
                    }
                    tracing::warn!(
                        patch_note_id,
                        attempt = failures,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %cause,
                        "Render progress poll failed, backing off",
                    );
                    wait = backoff;
                    backoff = self.timings.next_backoff(backoff);
                }
            }
        }

        self.active.lock().await.remove(&patch_note_id);
        tracing::debug!(patch_note_id, "Reconciliation loop exited");
    }

    /// Apply an event, write it through the store, then broadcast it.
    ///
    /// Returns `true` when the loop should stop: a terminal state was
    /// reached, the write lost to a newer generation, or persistence
    /// failed.
    async fn apply_and_publish(&mut self, event: RenderEvent) -> bool {
        let changed = match self.job.apply(&event) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::error!(
                    patch_note_id = self.job.patch_note_id,
                    error = %e,
                    "Rejected render state transition",
                );
                return true;
            }
        };
        if !changed {
            return false;
        }

        match self.store.update(&self.job, self.job.version).await {
            Ok(stored) => {
                self.job = stored;
                self.broadcaster.publish(self.job.clone()).await;
                self.job.is_terminal()
            }
            Err(StoreError::Conflict { .. }) => {
                // A newer generation owns the row; this loop is stale and
                // must not clobber it.
                tracing::info!(
                    patch_note_id = self.job.patch_note_id,
                    "Render job superseded, stopping stale loop",
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    patch_note_id = self.job.patch_note_id,
                    error = %e,
                    "Failed to persist render transition",
                );
                true
            }
        }
    }
}

/// A terminal failure expressed as a snapshot, so the state machine has a
/// single failure path.
fn fail_event(cause: String) -> RenderEvent {
    RenderEvent::Snapshot(ProgressSnapshot {
        percent: 0,
        done: false,
        fatal_error: Some(cause),
        output_url: None,
    })
}
