//! Render orchestrator: idempotency guard and loop lifecycle.
//!
//! [`Orchestrator`] is the explicit registry of active job generations.
//! Created once at application startup, injected into request handlers,
//! and torn down by [`Orchestrator::shutdown`]. For each render request
//! it decides between reusing a finished result, attaching the caller to
//! an in-flight job, or starting a new generation -- and it guarantees at
//! most one reconciliation loop per patch note.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use patchcast_core::error::CoreError;
use patchcast_core::gateway::{GatewayError, RenderGateway};
use patchcast_core::render::{ExternalJobRef, RenderEvent, RenderJob, RenderParameters, RenderState};
use patchcast_core::store::{RenderJobStore, StoreError};
use patchcast_core::types::DbId;
use patchcast_events::{StatusBroadcaster, StatusReceiver};

use crate::config::RenderTimings;
use crate::poller::{ActiveGenerations, ReconciliationLoop};

/// Outcome of a render request, as decided by the idempotency guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderDecision {
    /// A finished result already exists; no new work was started.
    Reuse {
        /// Location of the existing video.
        result_url: String,
    },
    /// A render is already in flight; subscribe to its status instead.
    Attach,
    /// A new job generation was queued.
    Started,
}

/// Owner of all render-job lifecycles.
pub struct Orchestrator {
    store: Arc<dyn RenderJobStore>,
    gateway: Arc<dyn RenderGateway>,
    broadcaster: Arc<StatusBroadcaster>,
    timings: RenderTimings,
    active: Arc<ActiveGenerations>,
    tracker: TaskTracker,
    /// Master token; cancelling it stops every reconciliation loop.
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator with no active jobs.
    pub fn new(
        store: Arc<dyn RenderJobStore>,
        gateway: Arc<dyn RenderGateway>,
        broadcaster: Arc<StatusBroadcaster>,
        timings: RenderTimings,
    ) -> Self {
        Self {
            store,
            gateway,
            broadcaster,
            timings,
            active: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Handle a render request for a patch note.
    ///
    /// Decides between `Reuse`, `Attach`, and `Started` per the guard
    /// rules; `Started` means a generation was persisted as `Queued`,
    /// broadcast, and its reconciliation loop spawned. `force` against an
    /// in-flight job is rejected with [`CoreError::Conflict`].
    pub async fn start_render(
        &self,
        patch_note_id: DbId,
        params: RenderParameters,
        force: bool,
    ) -> Result<RenderDecision, CoreError> {
        // Reserve the subject under the registry lock before any I/O, so
        // two concurrent first requests settle on a synchronous map
        // insert -- exactly one of them proceeds to submit.
        let cancel = {
            let mut active = self.active.lock().await;
            if active.contains_key(&patch_note_id) {
                if force {
                    return Err(CoreError::Conflict(
                        "a render is already in progress; wait for it to finish before forcing a new one"
                            .to_string(),
                    ));
                }
                return Ok(RenderDecision::Attach);
            }
            let cancel = self.cancel.child_token();
            active.insert(patch_note_id, cancel.clone());
            cancel
        };

        let outcome = self
            .begin_generation(patch_note_id, params, force, cancel)
            .await;

        // Release the reservation unless a loop now owns it.
        if !matches!(outcome, Ok(RenderDecision::Started)) {
            self.active.lock().await.remove(&patch_note_id);
        }
        outcome
    }

    /// Subscribe to a patch note's render status stream.
    ///
    /// The first message is the current persisted state; the stream
    /// closes after a terminal snapshot.
    pub async fn subscribe(&self, patch_note_id: DbId) -> Result<StatusReceiver, CoreError> {
        self.broadcaster.subscribe(patch_note_id).await
    }

    /// Current persisted job for a patch note, if any.
    pub async fn job(&self, patch_note_id: DbId) -> Result<Option<RenderJob>, CoreError> {
        self.store
            .find(patch_note_id)
            .await
            .map_err(|e| CoreError::Internal(format!("failed to load render job: {e}")))
    }

    /// Number of job generations currently being reconciled.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Stop every reconciliation loop and close all status streams.
    ///
    /// Loops stopped this way do not emit a terminal state; their jobs
    /// stay restartable on the next render request.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.broadcaster.close_all().await;
        tracing::info!("Render orchestrator shut down");
    }

    // ---- private ----

    /// The `Start` path: decide against the persisted row, submit, write
    /// the `Queued` generation through the store, broadcast it, and spawn
    /// the reconciliation loop.
    async fn begin_generation(
        &self,
        patch_note_id: DbId,
        params: RenderParameters,
        force: bool,
        cancel: CancellationToken,
    ) -> Result<RenderDecision, CoreError> {
        let existing = self
            .store
            .find(patch_note_id)
            .await
            .map_err(|e| CoreError::Internal(format!("failed to load render job: {e}")))?;

        if let Some(job) = &existing {
            if let RenderState::Completed { result_url } = &job.state {
                if !force {
                    return Ok(RenderDecision::Reuse {
                        result_url: result_url.clone(),
                    });
                }
            }
            if !job.is_terminal() && !matches!(job.state, RenderState::Idle) {
                // The row says in-flight but no loop owns it: the process
                // restarted mid-render. Start over.
                tracing::warn!(
                    patch_note_id,
                    state = job.state.name(),
                    "Restarting render job orphaned by a previous process",
                );
            }
        }

        let external = self.submit_with_retry(patch_note_id, &params).await?;

        let stored = match existing {
            Some(mut job) => {
                let event = if matches!(job.state, RenderState::Idle) {
                    RenderEvent::SubmitAccepted {
                        external: external.clone(),
                    }
                } else {
                    RenderEvent::NewGeneration {
                        external: external.clone(),
                    }
                };
                job.apply(&event)
                    .map_err(|e| CoreError::Internal(format!("cannot restart render: {e}")))?;
                self.persist(job, false).await?
            }
            None => {
                let mut job = RenderJob::new(patch_note_id);
                job.apply(&RenderEvent::SubmitAccepted {
                    external: external.clone(),
                })
                .map_err(|e| CoreError::Internal(format!("cannot queue render: {e}")))?;
                self.persist(job, true).await?
            }
        };

        // Store first, then broadcast: a subscriber attaching right now
        // must observe state that is actually durable.
        self.broadcaster.publish(stored.clone()).await;

        tracing::info!(
            patch_note_id,
            render_id = %external.render_id,
            version = stored.version,
            "Render job queued",
        );

        self.tracker.spawn(
            ReconciliationLoop {
                store: Arc::clone(&self.store),
                gateway: Arc::clone(&self.gateway),
                broadcaster: Arc::clone(&self.broadcaster),
                timings: self.timings.clone(),
                active: Arc::clone(&self.active),
                job: stored,
                external,
                cancel,
            }
            .run(),
        );

        Ok(RenderDecision::Started)
    }

    /// Write a new generation's `Queued` state, as an insert for a first
    /// render or a versioned update over the previous generation.
    async fn persist(&self, job: RenderJob, fresh: bool) -> Result<RenderJob, CoreError> {
        let result = if fresh {
            self.store.insert(&job).await
        } else {
            self.store.update(&job, job.version).await
        };
        result.map_err(|e| match e {
            StoreError::Conflict { .. } => CoreError::Conflict(
                "render state changed concurrently, retry the request".to_string(),
            ),
            other => CoreError::Internal(format!("failed to persist render job: {other}")),
        })
    }

    /// Submit through the gateway, retrying transient failures with the
    /// shared backoff policy.
    async fn submit_with_retry(
        &self,
        patch_note_id: DbId,
        params: &RenderParameters,
    ) -> Result<ExternalJobRef, CoreError> {
        let mut backoff = self.timings.backoff_initial;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.gateway.submit(patch_note_id, params).await {
                Ok(external) => return Ok(external),
                Err(GatewayError::Fatal(cause)) => {
                    tracing::error!(patch_note_id, error = %cause, "Render submission rejected");
                    return Err(CoreError::Internal(format!(
                        "render submission rejected: {cause}"
                    )));
                }
                Err(GatewayError::Transient(cause)) => {
                    if attempt >= self.timings.max_submit_attempts {
                        tracing::error!(
                            patch_note_id,
                            attempt,
                            error = %cause,
                            "Render submission retries exhausted",
                        );
                        return Err(CoreError::Internal(format!(
                            "render service unreachable: {cause}"
                        )));
                    }
                    tracing::warn!(
                        patch_note_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %cause,
                        "Render submission failed, retrying",
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = self.timings.next_backoff(backoff);
                }
            }
        }
    }
}
