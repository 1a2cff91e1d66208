//! Integration tests for the render orchestrator.
//!
//! Exercises the idempotency guard, the reconciliation loop, and the
//! status fan-out together against a scripted gateway and the in-memory
//! store. All tests run on paused virtual time, so interval and backoff
//! waits resolve instantly and deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;

use patchcast_core::error::CoreError;
use patchcast_core::gateway::{GatewayError, RenderGateway};
use patchcast_core::render::{
    ExternalJobRef, ProgressSnapshot, RenderEvent, RenderJob, RenderParameters, RenderState,
    TIMEOUT_ERROR,
};
use patchcast_core::store::{MemoryRenderJobStore, RenderJobStore};
use patchcast_core::types::DbId;
use patchcast_events::{StatusBroadcaster, StatusReceiver};
use patchcast_orchestrator::{Orchestrator, RenderDecision, RenderTimings};

// ---------------------------------------------------------------------------
// Scripted gateway
// ---------------------------------------------------------------------------

/// Render gateway that answers polls from a script and falls back to a
/// fixed response when the script runs dry.
struct MockGateway {
    submits: AtomicU32,
    polls: AtomicU32,
    /// Submissions up to this ordinal fail with a transient error.
    fail_submits: u32,
    /// Simulated submission latency; widens guard race windows.
    submit_delay: Duration,
    script: Mutex<VecDeque<Result<ProgressSnapshot, GatewayError>>>,
    default_poll: Result<ProgressSnapshot, GatewayError>,
}

impl MockGateway {
    fn new(script: Vec<Result<ProgressSnapshot, GatewayError>>) -> Self {
        Self {
            submits: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            fail_submits: 0,
            submit_delay: Duration::from_millis(5),
            script: Mutex::new(script.into()),
            default_poll: Ok(progress(10)),
        }
    }

    fn with_default_poll(mut self, default_poll: Result<ProgressSnapshot, GatewayError>) -> Self {
        self.default_poll = default_poll;
        self
    }

    fn failing_submits(mut self, count: u32) -> Self {
        self.fail_submits = count;
        self
    }

    fn push_script(&self, responses: Vec<Result<ProgressSnapshot, GatewayError>>) {
        self.script.lock().unwrap().extend(responses);
    }

    fn submit_count(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderGateway for MockGateway {
    async fn submit(
        &self,
        _patch_note_id: DbId,
        _params: &RenderParameters,
    ) -> Result<ExternalJobRef, GatewayError> {
        let ordinal = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.submit_delay).await;
        if ordinal <= self.fail_submits {
            return Err(GatewayError::Transient("connection refused".to_string()));
        }
        Ok(ExternalJobRef {
            render_id: format!("r-{ordinal}"),
            bucket_name: "renders".to_string(),
        })
    }

    async fn poll(&self, _external: &ExternalJobRef) -> Result<ProgressSnapshot, GatewayError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default_poll.clone())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn progress(percent: u8) -> ProgressSnapshot {
    ProgressSnapshot {
        percent,
        done: false,
        fatal_error: None,
        output_url: None,
    }
}

fn finished(url: &str) -> ProgressSnapshot {
    ProgressSnapshot {
        percent: 100,
        done: true,
        fatal_error: None,
        output_url: Some(url.to_string()),
    }
}

fn params() -> RenderParameters {
    RenderParameters {
        composition: "patch-note".to_string(),
        input_props: serde_json::json!({ "noteId": 1 }),
    }
}

fn fast_timings() -> RenderTimings {
    RenderTimings {
        poll_interval: Duration::from_millis(50),
        deadline: Duration::from_secs(30),
        max_submit_attempts: 3,
        max_transient_failures: 5,
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
        backoff_multiplier: 2.0,
    }
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<MemoryRenderJobStore>,
    gateway: Arc<MockGateway>,
}

fn harness(gateway: MockGateway, timings: RenderTimings) -> Harness {
    let store = Arc::new(MemoryRenderJobStore::new());
    let gateway = Arc::new(gateway);
    let store_dyn: Arc<dyn RenderJobStore> = store.clone();
    let broadcaster = Arc::new(StatusBroadcaster::new(Arc::clone(&store_dyn)));
    let orchestrator = Orchestrator::new(
        store_dyn,
        gateway.clone(),
        broadcaster,
        timings,
    );
    Harness {
        orchestrator,
        store,
        gateway,
    }
}

/// Drain a status stream until the broadcaster closes it.
async fn collect(mut rx: StatusReceiver) -> Vec<RenderJob> {
    tokio::time::timeout(Duration::from_secs(60), async {
        let mut out = Vec::new();
        while let Some(job) = rx.recv().await {
            out.push(job);
        }
        out
    })
    .await
    .expect("status stream did not close in time")
}

fn state_names(jobs: &[RenderJob]) -> Vec<&'static str> {
    jobs.iter().map(|j| j.state.name()).collect()
}

/// A completed job row, as left behind by an earlier run.
fn completed_row(patch_note_id: DbId, url: &str) -> RenderJob {
    let mut job = RenderJob::new(patch_note_id);
    job.apply(&RenderEvent::SubmitAccepted {
        external: ExternalJobRef {
            render_id: "r-old".to_string(),
            bucket_name: "renders".to_string(),
        },
    })
    .unwrap();
    job.apply(&RenderEvent::Snapshot(finished(url))).unwrap();
    job
}

// ---------------------------------------------------------------------------
// Happy path and ordering
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn subscriber_sees_full_transition_sequence() {
    let gateway = MockGateway::new(vec![
        Ok(progress(0)),
        Ok(progress(45)),
        Ok(finished("s3://renders/note-1.mp4")),
    ]);
    let h = harness(gateway, fast_timings());

    let decision = h.orchestrator.start_render(1, params(), false).await.unwrap();
    assert_eq!(decision, RenderDecision::Started);

    let events = collect(h.orchestrator.subscribe(1).await.unwrap()).await;
    assert_eq!(
        state_names(&events),
        vec!["queued", "rendering", "rendering", "completed"]
    );
    assert_eq!(events[1].state.progress(), Some(0));
    assert_eq!(events[2].state.progress(), Some(45));
    assert_matches!(
        &events[3].state,
        RenderState::Completed { result_url } if result_url == "s3://renders/note-1.mp4"
    );

    // The loop exited and deregistered itself.
    assert_eq!(h.orchestrator.active_count().await, 0);
    assert_eq!(h.gateway.poll_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn stale_percentages_are_never_delivered() {
    let gateway = MockGateway::new(vec![
        Ok(progress(50)),
        Ok(progress(30)),
        Ok(progress(50)),
        Ok(progress(80)),
        Ok(finished("s3://renders/note-1.mp4")),
    ]);
    let h = harness(gateway, fast_timings());

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    let events = collect(h.orchestrator.subscribe(1).await.unwrap()).await;

    let percents: Vec<_> = events.iter().filter_map(|j| j.state.progress()).collect();
    assert_eq!(percents, vec![50, 80, 100]);
    // Progress observed by the subscriber is strictly non-decreasing.
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn second_request_attaches_while_running() {
    let gateway = MockGateway::new(vec![]);
    let h = harness(gateway, fast_timings());

    assert_eq!(
        h.orchestrator.start_render(1, params(), false).await.unwrap(),
        RenderDecision::Started
    );
    assert_eq!(
        h.orchestrator.start_render(1, params(), false).await.unwrap(),
        RenderDecision::Attach
    );

    // Only one submission ever reached the render service.
    assert_eq!(h.gateway.submit_count(), 1);
    h.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_start_exactly_one_generation() {
    let gateway = MockGateway::new(vec![]);
    let h = harness(gateway, fast_timings());

    // The first request is still inside the (slow) submit call when the
    // second one arrives.
    let (first, second) = tokio::join!(
        h.orchestrator.start_render(1, params(), false),
        h.orchestrator.start_render(1, params(), false),
    );

    let decisions = [first.unwrap(), second.unwrap()];
    assert!(decisions.contains(&RenderDecision::Started));
    assert!(decisions.contains(&RenderDecision::Attach));
    assert_eq!(h.gateway.submit_count(), 1);
    h.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn completed_result_is_reused() {
    let gateway = MockGateway::new(vec![]);
    let h = harness(gateway, fast_timings());
    h.store
        .insert(&completed_row(1, "s3://renders/note-1.mp4"))
        .await
        .unwrap();

    let decision = h.orchestrator.start_render(1, params(), false).await.unwrap();
    assert_matches!(
        decision,
        RenderDecision::Reuse { result_url } if result_url == "s3://renders/note-1.mp4"
    );
    assert_eq!(h.gateway.submit_count(), 0);
    assert_eq!(h.orchestrator.active_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn force_while_active_is_rejected() {
    let gateway = MockGateway::new(vec![]);
    let h = harness(gateway, fast_timings());

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    let err = h.orchestrator.start_render(1, params(), true).await.unwrap_err();
    assert_matches!(err, CoreError::Conflict(_));

    h.orchestrator.shutdown().await;
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fatal_first_poll_fails_without_rendering() {
    let gateway = MockGateway::new(vec![Err(GatewayError::Fatal(
        "composition crashed".to_string(),
    ))]);
    let h = harness(gateway, fast_timings());

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    let events = collect(h.orchestrator.subscribe(1).await.unwrap()).await;

    assert_eq!(state_names(&events), vec!["queued", "failed"]);
    assert_matches!(
        &events[1].state,
        RenderState::Failed { error } if error == "composition crashed"
    );
}

#[tokio::test(start_paused = true)]
async fn fatal_poll_reaches_every_subscriber_exactly_once() {
    let gateway = MockGateway::new(vec![
        Ok(progress(20)),
        Err(GatewayError::Fatal("worker died".to_string())),
    ]);
    let h = harness(gateway, fast_timings());

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    let rx1 = h.orchestrator.subscribe(1).await.unwrap();
    let rx2 = h.orchestrator.subscribe(1).await.unwrap();

    for events in [collect(rx1).await, collect(rx2).await] {
        let terminal: Vec<_> = events.iter().filter(|j| j.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].state.name(), "failed");
    }
}

#[tokio::test(start_paused = true)]
async fn transient_poll_failures_stay_invisible() {
    let gateway = MockGateway::new(vec![
        Err(GatewayError::Transient("timeout".to_string())),
        Err(GatewayError::Transient("timeout".to_string())),
        Ok(finished("s3://renders/note-1.mp4")),
    ]);
    let h = harness(gateway, fast_timings());

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    let events = collect(h.orchestrator.subscribe(1).await.unwrap()).await;

    // Subscribers never hear about retried hiccups.
    assert_eq!(state_names(&events), vec!["queued", "completed"]);
    assert_eq!(h.gateway.poll_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retry_budget_fails_the_job() {
    let gateway = MockGateway::new(vec![])
        .with_default_poll(Err(GatewayError::Transient("timeout".to_string())));
    let mut timings = fast_timings();
    timings.max_transient_failures = 2;
    let h = harness(gateway, timings);

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    let events = collect(h.orchestrator.subscribe(1).await.unwrap()).await;

    assert_eq!(state_names(&events), vec!["queued", "failed"]);
    assert_matches!(
        &events[1].state,
        RenderState::Failed { error } if error.starts_with("render service unreachable")
    );
    // Budget of 2 retries means exactly 3 attempts.
    assert_eq!(h.gateway.poll_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn deadline_times_out_and_stops_polling() {
    let gateway = MockGateway::new(vec![]);
    let mut timings = fast_timings();
    timings.poll_interval = Duration::from_millis(10);
    timings.deadline = Duration::from_millis(95);
    let h = harness(gateway, timings);

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    let events = collect(h.orchestrator.subscribe(1).await.unwrap()).await;

    let last = events.last().unwrap();
    assert_matches!(&last.state, RenderState::Failed { error } if error == TIMEOUT_ERROR);

    // No further polls happen once the job timed out.
    let polls_at_timeout = h.gateway.poll_count();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.gateway.poll_count(), polls_at_timeout);

    // The timeout is durable, not just broadcast.
    let stored = h.store.find(1).await.unwrap().unwrap();
    assert_matches!(&stored.state, RenderState::Failed { error } if error == TIMEOUT_ERROR);
}

#[tokio::test(start_paused = true)]
async fn failed_submission_releases_the_subject() {
    let gateway = MockGateway::new(vec![]).failing_submits(u32::MAX);
    let mut timings = fast_timings();
    timings.max_submit_attempts = 2;
    let h = harness(gateway, timings);

    let err = h.orchestrator.start_render(1, params(), false).await.unwrap_err();
    assert_matches!(err, CoreError::Internal(_));
    assert_eq!(h.gateway.submit_count(), 2);

    // Nothing was persisted and the subject is free for the next attempt.
    assert_eq!(h.orchestrator.active_count().await, 0);
    assert!(h.store.find(1).await.unwrap().is_none());
    assert_matches!(
        h.orchestrator.subscribe(1).await,
        Err(CoreError::NotFound { .. })
    );
}

// ---------------------------------------------------------------------------
// Late subscribers and generations
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn late_subscriber_gets_single_terminal_snapshot() {
    let gateway = MockGateway::new(vec![Ok(finished("s3://renders/note-1.mp4"))]);
    let h = harness(gateway, fast_timings());

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    collect(h.orchestrator.subscribe(1).await.unwrap()).await;

    // The job is long done; a fresh subscriber gets exactly one message.
    let events = collect(h.orchestrator.subscribe(1).await.unwrap()).await;
    assert_eq!(events.len(), 1);
    assert_matches!(
        &events[0].state,
        RenderState::Completed { result_url } if result_url == "s3://renders/note-1.mp4"
    );
}

#[tokio::test(start_paused = true)]
async fn forced_rerender_keeps_prior_result_readable() {
    let gateway = MockGateway::new(vec![Ok(finished("s3://renders/v1.mp4"))]);
    let h = harness(gateway, fast_timings());

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    collect(h.orchestrator.subscribe(1).await.unwrap()).await;

    h.gateway
        .push_script(vec![Ok(progress(20)), Ok(finished("s3://renders/v2.mp4"))]);
    assert_eq!(
        h.orchestrator.start_render(1, params(), true).await.unwrap(),
        RenderDecision::Started
    );

    // While the replacement renders, the old video stays available.
    let mid = h.orchestrator.job(1).await.unwrap().unwrap();
    assert_eq!(mid.state.name(), "queued");
    assert_eq!(mid.available_result_url(), Some("s3://renders/v1.mp4"));

    let events = collect(h.orchestrator.subscribe(1).await.unwrap()).await;
    let last = events.last().unwrap();
    assert_matches!(
        &last.state,
        RenderState::Completed { result_url } if result_url == "s3://renders/v2.mp4"
    );
    assert_eq!(last.available_result_url(), Some("s3://renders/v2.mp4"));
    assert_eq!(last.prior_result_url, None);
    assert_eq!(h.gateway.submit_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_job_can_be_rendered_again_without_force() {
    let gateway = MockGateway::new(vec![Err(GatewayError::Fatal("boom".to_string()))]);
    let h = harness(gateway, fast_timings());

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    collect(h.orchestrator.subscribe(1).await.unwrap()).await;

    h.gateway.push_script(vec![Ok(finished("s3://renders/v2.mp4"))]);
    assert_eq!(
        h.orchestrator.start_render(1, params(), false).await.unwrap(),
        RenderDecision::Started
    );

    let events = collect(h.orchestrator.subscribe(1).await.unwrap()).await;
    assert_eq!(events.last().unwrap().state.name(), "completed");
}

#[tokio::test(start_paused = true)]
async fn orphaned_job_is_restarted() {
    // A row left mid-render by a previous process: no loop owns it.
    let gateway = MockGateway::new(vec![Ok(finished("s3://renders/after-restart.mp4"))]);
    let h = harness(gateway, fast_timings());

    let mut orphan = RenderJob::new(1);
    orphan
        .apply(&RenderEvent::SubmitAccepted {
            external: ExternalJobRef {
                render_id: "r-dead".to_string(),
                bucket_name: "renders".to_string(),
            },
        })
        .unwrap();
    orphan.apply(&RenderEvent::Snapshot(progress(30))).unwrap();
    h.store.insert(&orphan).await.unwrap();

    let decision = h.orchestrator.start_render(1, params(), false).await.unwrap();
    assert_eq!(decision, RenderDecision::Started);
    assert_eq!(h.gateway.submit_count(), 1);

    let events = collect(h.orchestrator.subscribe(1).await.unwrap()).await;
    assert_eq!(events.last().unwrap().state.name(), "completed");
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn shutdown_stops_loops_without_emitting_terminal_state() {
    let gateway = MockGateway::new(vec![]);
    let h = harness(gateway, fast_timings());

    h.orchestrator.start_render(1, params(), false).await.unwrap();
    let rx = h.orchestrator.subscribe(1).await.unwrap();

    h.orchestrator.shutdown().await;
    assert_eq!(h.orchestrator.active_count().await, 0);

    // The stream closes, but no terminal state was fabricated; the job
    // stays restartable.
    let events = collect(rx).await;
    assert!(events.iter().all(|j| !j.is_terminal()));
    let stored = h.store.find(1).await.unwrap().unwrap();
    assert!(!stored.is_terminal());
}
