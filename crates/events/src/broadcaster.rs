//! Per-patch-note status fan-out.
//!
//! [`StatusBroadcaster`] is the bridge between the reconciliation loops
//! (one writer per active job generation) and status-stream clients (any
//! number of readers per patch note). It is designed to be shared via
//! `Arc<StatusBroadcaster>` across the application.
//!
//! Delivery guarantees:
//!
//! - A new subscriber's first message is always the job's *current*
//!   persisted state, never just future deltas.
//! - Every subscriber of one patch note sees transitions in the same
//!   total order (all sends happen under the topic lock).
//! - A terminal snapshot is delivered to every subscriber and then the
//!   broadcaster closes their streams -- the only server-initiated close
//!   in normal operation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use patchcast_core::error::CoreError;
use patchcast_core::render::RenderJob;
use patchcast_core::store::RenderJobStore;
use patchcast_core::types::DbId;

/// Receiving half of one subscriber's status stream.
///
/// Yields [`RenderJob`] snapshots in transition order; the channel closes
/// after the terminal snapshot. Dropping the receiver unsubscribes.
pub type StatusReceiver = mpsc::UnboundedReceiver<RenderJob>;

type StatusSender = mpsc::UnboundedSender<RenderJob>;

/// Live fan-out state for one patch note.
struct Topic {
    /// Last snapshot published for this subject; replayed to late joiners.
    last: RenderJob,
    subscribers: Vec<StatusSender>,
}

/// Fan-out hub mapping patch note ids to their subscriber sets.
///
/// The store handle exists so `subscribe` can fall back to the persisted
/// state when no loop has published yet -- holding the topic lock across
/// that read is what makes snapshot-first delivery race-free against a
/// concurrent terminal publish.
pub struct StatusBroadcaster {
    topics: Mutex<HashMap<DbId, Topic>>,
    store: Arc<dyn RenderJobStore>,
}

impl StatusBroadcaster {
    /// Create a broadcaster backed by the given job store.
    pub fn new(store: Arc<dyn RenderJobStore>) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Subscribe to a patch note's render status.
    ///
    /// The returned stream starts with the current state and closes after
    /// a terminal snapshot. Subscribing to an already-terminal job yields
    /// exactly one message and an immediately closed stream. Fails with
    /// [`CoreError::NotFound`] when no render job exists for the id.
    pub async fn subscribe(&self, patch_note_id: DbId) -> Result<StatusReceiver, CoreError> {
        let mut topics = self.topics.lock().await;

        if let Some(topic) = topics.get_mut(&patch_note_id) {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(topic.last.clone());
            topic.subscribers.push(tx);
            return Ok(rx);
        }

        // No live topic: start from the persisted state. The lock stays
        // held across the read so a terminal publish cannot slip between
        // this read and the registration below.
        let job = self
            .store
            .find(patch_note_id)
            .await
            .map_err(|e| CoreError::Internal(format!("failed to load render job: {e}")))?
            .ok_or(CoreError::NotFound {
                entity: "RenderJob",
                id: patch_note_id,
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(job.clone());
        if !job.is_terminal() {
            topics.insert(
                patch_note_id,
                Topic {
                    last: job,
                    subscribers: vec![tx],
                },
            );
        }
        Ok(rx)
    }

    /// Publish a persisted snapshot to all subscribers of its patch note.
    ///
    /// Must only be called with state that has already been written to
    /// the store. A terminal snapshot closes every subscriber stream and
    /// removes the topic.
    pub async fn publish(&self, job: RenderJob) {
        let mut topics = self.topics.lock().await;
        let patch_note_id = job.patch_note_id;

        if job.is_terminal() {
            if let Some(topic) = topics.remove(&patch_note_id) {
                let delivered = topic.subscribers.len();
                for tx in topic.subscribers {
                    let _ = tx.send(job.clone());
                    // Sender dropped here; the subscriber's stream closes
                    // after it drains the terminal snapshot.
                }
                tracing::debug!(
                    patch_note_id,
                    state = job.state.name(),
                    delivered,
                    "Terminal render state broadcast",
                );
            }
            return;
        }

        let topic = topics.entry(patch_note_id).or_insert_with(|| Topic {
            last: job.clone(),
            subscribers: Vec::new(),
        });
        topic.last = job.clone();
        // Closed channels mean the client went away; drop them silently.
        topic.subscribers.retain(|tx| tx.send(job.clone()).is_ok());
    }

    /// Number of live subscribers for a patch note.
    pub async fn subscriber_count(&self, patch_note_id: DbId) -> usize {
        self.topics
            .lock()
            .await
            .get(&patch_note_id)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    /// Drop every topic, closing all subscriber streams.
    ///
    /// Used during graceful shutdown, after the reconciliation loops have
    /// stopped.
    pub async fn close_all(&self) {
        let mut topics = self.topics.lock().await;
        let count = topics.len();
        topics.clear();
        if count > 0 {
            tracing::info!(count, "Closed all render status topics");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use patchcast_core::render::{ExternalJobRef, ProgressSnapshot, RenderEvent};
    use patchcast_core::store::MemoryRenderJobStore;

    use super::*;

    fn external() -> ExternalJobRef {
        ExternalJobRef {
            render_id: "r-1".to_string(),
            bucket_name: "renders".to_string(),
        }
    }

    fn queued(patch_note_id: DbId) -> RenderJob {
        let mut job = RenderJob::new(patch_note_id);
        job.apply(&RenderEvent::SubmitAccepted {
            external: external(),
        })
        .unwrap();
        job
    }

    fn rendering(patch_note_id: DbId, percent: u8) -> RenderJob {
        let mut job = queued(patch_note_id);
        job.apply(&RenderEvent::Snapshot(ProgressSnapshot {
            percent,
            done: false,
            fatal_error: None,
            output_url: None,
        }))
        .unwrap();
        job
    }

    fn completed(patch_note_id: DbId) -> RenderJob {
        let mut job = rendering(patch_note_id, 50);
        job.apply(&RenderEvent::Snapshot(ProgressSnapshot {
            percent: 100,
            done: true,
            fatal_error: None,
            output_url: Some("s3://renders/x.mp4".to_string()),
        }))
        .unwrap();
        job
    }

    async fn broadcaster_with(jobs: Vec<RenderJob>) -> StatusBroadcaster {
        let store = Arc::new(MemoryRenderJobStore::new());
        for job in jobs {
            store.insert(&job).await.unwrap();
        }
        StatusBroadcaster::new(store)
    }

    #[tokio::test]
    async fn first_message_is_persisted_state() {
        let broadcaster = broadcaster_with(vec![queued(1)]).await;

        let mut rx = broadcaster.subscribe(1).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.state.name(), "queued");
    }

    #[tokio::test]
    async fn first_message_prefers_topic_over_store() {
        // The store still says queued, but a fresher snapshot has been
        // published since.
        let broadcaster = broadcaster_with(vec![queued(1)]).await;
        broadcaster.publish(rendering(1, 30)).await;

        let mut rx = broadcaster.subscribe(1).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.state.progress(), Some(30));
    }

    #[tokio::test]
    async fn subscribers_see_the_same_order() {
        let broadcaster = broadcaster_with(vec![queued(1)]).await;
        let mut rx1 = broadcaster.subscribe(1).await.unwrap();
        let mut rx2 = broadcaster.subscribe(1).await.unwrap();

        broadcaster.publish(rendering(1, 10)).await;
        broadcaster.publish(rendering(1, 60)).await;
        broadcaster.publish(completed(1)).await;

        for rx in [&mut rx1, &mut rx2] {
            let mut names = Vec::new();
            let mut percents = Vec::new();
            while let Some(job) = rx.recv().await {
                names.push(job.state.name());
                percents.push(job.state.progress());
            }
            assert_eq!(names, vec!["queued", "rendering", "rendering", "completed"]);
            assert_eq!(percents, vec![None, Some(10), Some(60), Some(100)]);
        }
    }

    #[tokio::test]
    async fn terminal_publish_closes_streams() {
        let broadcaster = broadcaster_with(vec![queued(1)]).await;
        let mut rx = broadcaster.subscribe(1).await.unwrap();

        broadcaster.publish(completed(1)).await;

        rx.recv().await.unwrap(); // queued
        let terminal = rx.recv().await.unwrap();
        assert!(terminal.is_terminal());
        assert!(rx.recv().await.is_none());
        assert_eq!(broadcaster.subscriber_count(1).await, 0);
    }

    #[tokio::test]
    async fn subscribing_to_terminal_job_yields_one_message() {
        let broadcaster = broadcaster_with(vec![completed(1)]).await;

        let mut rx = broadcaster.subscribe(1).await.unwrap();
        let only = rx.recv().await.unwrap();
        assert!(only.is_terminal());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_patch_note_is_not_found() {
        let broadcaster = broadcaster_with(vec![]).await;
        assert_matches!(
            broadcaster.subscribe(42).await,
            Err(CoreError::NotFound { id: 42, .. })
        );
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let broadcaster = broadcaster_with(vec![queued(1)]).await;
        let rx1 = broadcaster.subscribe(1).await.unwrap();
        let mut rx2 = broadcaster.subscribe(1).await.unwrap();
        drop(rx1);

        broadcaster.publish(rendering(1, 80)).await;

        rx2.recv().await.unwrap(); // queued
        assert_eq!(rx2.recv().await.unwrap().state.progress(), Some(80));
        assert_eq!(broadcaster.subscriber_count(1).await, 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let broadcaster = broadcaster_with(vec![]).await;
        broadcaster.publish(rendering(9, 5)).await;
        broadcaster.publish(completed(9)).await;
    }
}
