use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::HealthMetrics;
use crate::rollup::{Aggregator, PassReport};
use crate::store::TotalsStore;

/// Lifecycle of the rollup loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the store to become ready.
    Starting,
    /// Sleeping until the next pass.
    Idle,
    /// A pass is in flight.
    Running,
    /// Sleeping after a failed pass.
    Retrying,
    /// Cancelled; the loop has exited.
    Stopped,
}

impl SchedulerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Stopped => "stopped",
        }
    }

    /// Numeric code exported on the state gauge.
    pub fn code(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Idle => 1,
            Self::Running => 2,
            Self::Retrying => 3,
            Self::Stopped => 4,
        }
    }
}

/// Retry policy for failed passes and readiness checks.
///
/// Attempts are unbounded and every retry waits the same delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

/// Unit of work driven by the [`Scheduler`].
pub trait RollupJob: Send + Sync {
    /// Readiness check run before the first pass.
    fn prepare(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Runs a single pass.
    fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = anyhow::Result<PassReport>> + Send;
}

impl<S: TotalsStore> RollupJob for Aggregator<S> {
    async fn prepare(&self) -> anyhow::Result<()> {
        self.store()
            .prepare()
            .await
            .with_context(|| format!("preparing {} store", self.store().name()))
    }

    async fn run_once(&self, cancel: &CancellationToken) -> anyhow::Result<PassReport> {
        let report = self
            .run_pass_now(cancel)
            .await
            .context("running rollup pass")?;
        Ok(report)
    }
}

/// Runs a [`RollupJob`] on a fixed interval until cancelled.
///
/// Passes never overlap: the next one is scheduled only after the previous
/// pass and its sleep have both finished. A failed pass is logged and retried
/// after the retry delay; it never ends the loop.
pub struct Scheduler {
    interval: Duration,
    retry: RetryPolicy,
    state: watch::Sender<SchedulerState>,
    health: Option<Arc<HealthMetrics>>,
}

impl Scheduler {
    pub fn new(interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            interval,
            retry,
            state: watch::Sender::new(SchedulerState::Starting),
            health: None,
        }
    }

    /// Attaches health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Returns a receiver that observes state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Drives `job` until `cancel` fires.
    pub async fn run<J: RollupJob>(&self, job: &J, cancel: CancellationToken) {
        self.set_state(SchedulerState::Starting);

        if self.wait_ready(job, &cancel).await {
            info!(
                interval = ?self.interval,
                retry_delay = ?self.retry.delay,
                "rollup scheduler started",
            );
            self.run_loop(job, &cancel).await;
        }

        self.set_state(SchedulerState::Stopped);
        info!("rollup scheduler stopped");
    }

    /// Retries `prepare` until it succeeds. Returns false if cancelled first.
    async fn wait_ready<J: RollupJob>(&self, job: &J, cancel: &CancellationToken) -> bool {
        let mut attempt = 0u32;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = job.prepare() => result,
            };

            match result {
                Ok(()) => {
                    debug!(attempts = attempt + 1, "rollup store ready");
                    return true;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    if let Some(health) = &self.health {
                        health.readiness_failures.inc();
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        error = %format!("{e:#}"),
                        attempt,
                        retry_in = ?delay,
                        "rollup store not ready",
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn run_loop<J: RollupJob>(&self, job: &J, cancel: &CancellationToken) {
        let mut failures = 0u32;

        while !cancel.is_cancelled() {
            self.set_state(SchedulerState::Running);
            let started = Instant::now();
            let result = job.run_once(cancel).await;
            let elapsed = started.elapsed();

            if let Some(health) = &self.health {
                health.pass_duration.observe(elapsed.as_secs_f64());
            }

            let delay = match result {
                Ok(report) => {
                    failures = 0;
                    self.record_success(&report, elapsed);
                    if report.cancelled {
                        break;
                    }
                    self.set_state(SchedulerState::Idle);
                    self.interval
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.record_outcome("failure");
                    let delay = self.retry.delay_for_attempt(failures);
                    error!(
                        error = %format!("{e:#}"),
                        consecutive_failures = failures,
                        retry_in = ?delay,
                        "rollup pass failed",
                    );
                    self.set_state(SchedulerState::Retrying);
                    delay
                }
            };

            if !sleep_or_cancel(delay, cancel).await {
                break;
            }
        }
    }

    fn record_success(&self, report: &PassReport, elapsed: Duration) {
        if report.cancelled {
            self.record_outcome("cancelled");
            info!(
                entities_updated = report.entities_updated,
                hours_added = report.hours_added,
                "rollup pass cancelled",
            );
            return;
        }

        self.record_outcome("success");
        if let Some(health) = &self.health {
            health
                .last_success_timestamp
                .set(Utc::now().timestamp() as f64);
        }

        if report.is_empty() {
            debug!(
                samples_read = report.samples_read,
                elapsed = ?elapsed,
                "rollup pass found nothing to commit",
            );
        } else {
            info!(
                samples_read = report.samples_read,
                buckets = report.buckets_considered,
                valid_buckets = report.valid_buckets,
                entities_updated = report.entities_updated,
                hours_added = report.hours_added,
                regressions = report.regressions,
                elapsed = ?elapsed,
                "rollup pass complete",
            );
        }
    }

    fn record_outcome(&self, outcome: &str) {
        if let Some(health) = &self.health {
            health.passes.with_label_values(&[outcome]).inc();
        }
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
        if let Some(health) = &self.health {
            health.set_scheduler_state(state);
        }
    }
}

/// Sleeps for `delay`. Returns false if cancelled before it elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Scripted job recording when each call happened.
    #[derive(Default)]
    struct FakeJob {
        prepare_failures: AtomicU32,
        prepare_calls: Mutex<Vec<Instant>>,
        outcomes: Mutex<VecDeque<Result<PassReport, String>>>,
        runs: Mutex<Vec<Instant>>,
        run_time: Duration,
        in_flight: AtomicBool,
        overlapped: AtomicBool,
    }

    impl FakeJob {
        fn with_outcomes(outcomes: Vec<Result<PassReport, String>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            }
        }

        fn run_count(&self) -> usize {
            self.runs.lock().len()
        }

        fn run_gaps(&self) -> Vec<Duration> {
            let runs = self.runs.lock();
            runs.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    impl RollupJob for FakeJob {
        async fn prepare(&self) -> anyhow::Result<()> {
            self.prepare_calls.lock().push(Instant::now());
            let remaining = self.prepare_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.prepare_failures.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("store unreachable");
            }
            Ok(())
        }

        async fn run_once(&self, _cancel: &CancellationToken) -> anyhow::Result<PassReport> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.runs.lock().push(Instant::now());
            if !self.run_time.is_zero() {
                tokio::time::sleep(self.run_time).await;
            }
            self.in_flight.store(false, Ordering::SeqCst);

            let next = self.outcomes.lock().pop_front();
            match next {
                Some(Ok(report)) => Ok(report),
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
                None => Ok(PassReport::default()),
            }
        }
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let slack = Duration::from_millis(10);
        assert!(
            actual >= expected && actual <= expected + slack,
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    fn spawn(
        scheduler: Scheduler,
        job: Arc<FakeJob>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { scheduler.run(&*job, cancel).await })
    }

    #[test]
    fn test_retry_policy_is_fixed() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay, Duration::from_secs(5));
        for attempt in [1, 2, 10, u32::MAX] {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_state_codes() {
        let states = [
            SchedulerState::Starting,
            SchedulerState::Idle,
            SchedulerState::Running,
            SchedulerState::Retrying,
            SchedulerState::Stopped,
        ];
        for (i, state) in states.iter().enumerate() {
            assert_eq!(usize::from(state.code()), i);
        }
        assert_eq!(SchedulerState::Retrying.as_str(), "retrying");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pass_retries_after_delay() {
        let job = Arc::new(FakeJob::with_outcomes(vec![
            Err("connection reset".to_string()),
            Err("connection reset".to_string()),
            Ok(PassReport::default()),
        ]));
        let scheduler = Scheduler::new(
            Duration::from_secs(60),
            RetryPolicy::fixed(Duration::from_secs(5)),
        );
        let cancel = CancellationToken::new();
        let handle = spawn(scheduler, Arc::clone(&job), cancel.clone());

        tokio::time::sleep(Duration::from_secs(100)).await;
        cancel.cancel();
        handle.await.expect("scheduler task");

        let gaps = job.run_gaps();
        assert_eq!(gaps.len(), 3, "runs at 0s, 5s, 10s, 70s");
        assert_close(gaps[0], Duration::from_secs(5));
        assert_close(gaps[1], Duration::from_secs(5));
        assert_close(gaps[2], Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_passes_do_not_overlap() {
        let job = Arc::new(FakeJob {
            run_time: Duration::from_secs(90),
            ..Default::default()
        });
        let scheduler = Scheduler::new(Duration::from_secs(10), RetryPolicy::default());
        let cancel = CancellationToken::new();
        let handle = spawn(scheduler, Arc::clone(&job), cancel.clone());

        tokio::time::sleep(Duration::from_secs(250)).await;
        cancel.cancel();
        handle.await.expect("scheduler task");

        assert!(!job.overlapped.load(Ordering::SeqCst));
        for gap in job.run_gaps() {
            assert_close(gap, Duration::from_secs(100));
        }
        assert_eq!(job.run_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_gate_holds_first_pass() {
        let job = Arc::new(FakeJob {
            prepare_failures: AtomicU32::new(2),
            ..Default::default()
        });
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let scheduler = Scheduler::new(
            Duration::from_secs(60),
            RetryPolicy::fixed(Duration::from_secs(5)),
        )
        .with_health(Arc::clone(&health));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let handle = spawn(scheduler, Arc::clone(&job), cancel.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        handle.await.expect("scheduler task");

        assert_eq!(job.prepare_calls.lock().len(), 3);
        assert_eq!(health.readiness_failures.get(), 2.0);

        let runs = job.runs.lock();
        assert_eq!(runs.len(), 1);
        assert_close(runs[0] - start, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_stops_loop() {
        let job = Arc::new(FakeJob::default());
        let scheduler = Scheduler::new(Duration::from_secs(3600), RetryPolicy::default());
        let mut state = scheduler.subscribe();
        let cancel = CancellationToken::new();
        let handle = spawn(scheduler, Arc::clone(&job), cancel.clone());

        state
            .wait_for(|s| *s == SchedulerState::Idle)
            .await
            .expect("reaches idle");
        cancel.cancel();
        handle.await.expect("scheduler task");

        assert_eq!(*state.borrow(), SchedulerState::Stopped);
        assert_eq!(job.run_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_ready_skips_passes() {
        let job = Arc::new(FakeJob {
            prepare_failures: AtomicU32::new(u32::MAX),
            ..Default::default()
        });
        let scheduler = Scheduler::new(Duration::from_secs(60), RetryPolicy::default());
        let mut state = scheduler.subscribe();
        let cancel = CancellationToken::new();
        let handle = spawn(scheduler, Arc::clone(&job), cancel.clone());

        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        handle.await.expect("scheduler task");

        assert_eq!(job.run_count(), 0);
        assert_eq!(*state.borrow(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_are_counted() {
        let job = Arc::new(FakeJob::with_outcomes(vec![
            Err("boom".to_string()),
            Ok(PassReport {
                entities_updated: 1,
                hours_added: 2,
                ..Default::default()
            }),
        ]));
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let scheduler = Scheduler::new(Duration::from_secs(60), RetryPolicy::default())
            .with_health(Arc::clone(&health));
        let cancel = CancellationToken::new();
        let handle = spawn(scheduler, Arc::clone(&job), cancel.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        handle.await.expect("scheduler task");

        let failures = health.passes.with_label_values(&["failure"]).get();
        let successes = health.passes.with_label_values(&["success"]).get();
        assert_eq!(failures, 1.0);
        assert_eq!(successes, 1.0);
        assert!(health.last_success_timestamp.get() > 0.0);
        assert_eq!(health.pass_duration.get_sample_count(), 2);
    }
}
