//! Timing configuration for the render orchestrator.
//!
//! Every constant the reconciliation loop runs on (poll cadence, hard
//! deadline, retry budgets, backoff curve) is configuration, not code.
//! Defaults suit a render that takes a couple of minutes.

use std::time::Duration;

/// Tunable timings for submission and progress reconciliation.
#[derive(Debug, Clone)]
pub struct RenderTimings {
    /// Interval between progress polls.
    pub poll_interval: Duration,
    /// Hard wall-clock deadline for one job generation. Exceeding it
    /// fails the job with a timeout error.
    pub deadline: Duration,
    /// Total submission attempts before the render request is rejected.
    pub max_submit_attempts: u32,
    /// Consecutive transient poll failures tolerated before the job is
    /// failed.
    pub max_transient_failures: u32,
    /// Delay before the first retry after a transient failure.
    pub backoff_initial: Duration,
    /// Upper bound on the retry delay.
    pub backoff_max: Duration,
    /// Factor by which the retry delay grows after each failure.
    pub backoff_multiplier: f64,
}

impl Default for RenderTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            deadline: Duration::from_secs(600),
            max_submit_attempts: 3,
            max_transient_failures: 5,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RenderTimings {
    /// Load timings from environment variables with defaults.
    ///
    /// | Env Var                        | Default |
    /// |--------------------------------|---------|
    /// | `RENDER_POLL_INTERVAL_MS`      | `2000`  |
    /// | `RENDER_DEADLINE_SECS`         | `600`   |
    /// | `RENDER_MAX_SUBMIT_ATTEMPTS`   | `3`     |
    /// | `RENDER_MAX_TRANSIENT_FAILURES`| `5`     |
    /// | `RENDER_BACKOFF_INITIAL_MS`    | `500`   |
    /// | `RENDER_BACKOFF_MAX_MS`        | `10000` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: Duration::from_millis(env_u64(
                "RENDER_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            deadline: Duration::from_secs(env_u64(
                "RENDER_DEADLINE_SECS",
                defaults.deadline.as_secs(),
            )),
            max_submit_attempts: env_u64(
                "RENDER_MAX_SUBMIT_ATTEMPTS",
                defaults.max_submit_attempts as u64,
            ) as u32,
            max_transient_failures: env_u64(
                "RENDER_MAX_TRANSIENT_FAILURES",
                defaults.max_transient_failures as u64,
            ) as u32,
            backoff_initial: Duration::from_millis(env_u64(
                "RENDER_BACKOFF_INITIAL_MS",
                defaults.backoff_initial.as_millis() as u64,
            )),
            backoff_max: Duration::from_millis(env_u64(
                "RENDER_BACKOFF_MAX_MS",
                defaults.backoff_max.as_millis() as u64,
            )),
            backoff_multiplier: defaults.backoff_multiplier,
        }
    }

    /// Next backoff delay after a transient failure, clamped to
    /// [`RenderTimings::backoff_max`].
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.backoff_multiplier) as u64;
        Duration::from_millis(next_ms).min(self.backoff_max)
    }
}

/// Read an env var as u64, falling back to `default` when unset.
/// Panics on a malformed value -- misconfiguration should fail fast.
fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .unwrap_or_else(|_| panic!("{name} must be a valid u64")),
        Err(_) => default,
    }
}
