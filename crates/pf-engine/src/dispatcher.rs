//! Parallel job dispatcher with dynamic re-feeding.
//!
//! Every submitted job runs on its own tokio task. When a job terminates the
//! dispatcher builds its [`JobResult`] and hands it to the feeder callback on
//! the same task. The feeder may submit further jobs or call
//! [`Dispatcher::no_more_jobs`] from inside that callback.
//!
//! ```text
//! submit(jobs) ──► in_flight += 1 ──► spawn ──► runner.train(job)
//!                                                   │
//!                          ┌────────────────────────┘
//!                          ▼
//!                  feeder(result, &dispatcher)   (may submit / no_more_jobs)
//!                          │
//!                          ▼
//!                  in_flight -= 1 ──► attempt_complete()
//!
//! barrier resolves once: no_more_jobs && in_flight == 0
//! ```
//!
//! A job counts as in flight until its feeder callback has *returned*, so the
//! barrier cannot resolve while any callback might still submit follow-up
//! work, no matter which thread calls `no_more_jobs`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use pf_types::{Algo, DispatchError, TrainingError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::job::{Job, JobFailure, JobId, JobResult, JobSuccess};
use crate::runner::TrainingRunner;

/// Callback invoked once per finished job.
pub type Feeder<R> =
    dyn Fn(JobResult<<R as TrainingRunner>::Artifact>, &Dispatcher<R>) + Send + Sync;

/// Completion bookkeeping. Every transition happens under one lock so the
/// "resolve at most once" check and the misuse checks are exact.
#[derive(Debug, Default)]
struct BarrierState {
    in_flight: usize,
    no_more_jobs: bool,
    resolved: bool,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicUsize,
    delivered: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    resolutions: AtomicUsize,
}

/// A job currently training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningJob {
    pub job_id: JobId,
    pub algo: Algo,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time view of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub submitted: usize,
    pub delivered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub barrier_resolutions: usize,
}

struct Shared<R: TrainingRunner> {
    runner: Arc<R>,
    feeder: Box<Feeder<R>>,
    runtime: Handle,
    barrier: Mutex<BarrierState>,
    done_tx: watch::Sender<bool>,
    counters: Counters,
    running: DashMap<JobId, RunningJob>,
    started: Instant,
}

/// Launches jobs, routes their results to the feeder, and resolves a single
/// barrier once submissions are closed and nothing is in flight.
///
/// Cloning yields another handle to the same dispatcher.
pub struct Dispatcher<R: TrainingRunner> {
    shared: Arc<Shared<R>>,
}

impl<R: TrainingRunner> Clone for Dispatcher<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: TrainingRunner> Dispatcher<R> {
    /// Create a dispatcher bound to the current tokio runtime.
    pub fn new<F>(runner: Arc<R>, feeder: F) -> Result<Self, DispatchError>
    where
        F: Fn(JobResult<R::Artifact>, &Dispatcher<R>) + Send + Sync + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        Ok(Self::with_runtime(runtime, runner, feeder))
    }

    /// Create a dispatcher that spawns jobs on `runtime`.
    pub fn with_runtime<F>(runtime: Handle, runner: Arc<R>, feeder: F) -> Self
    where
        F: Fn(JobResult<R::Artifact>, &Dispatcher<R>) + Send + Sync + 'static,
    {
        let (done_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                runner,
                feeder: Box::new(feeder),
                runtime,
                barrier: Mutex::new(BarrierState::default()),
                done_tx,
                counters: Counters::default(),
                running: DashMap::new(),
                started: Instant::now(),
            }),
        }
    }

    /// Launch every job without waiting for any of them.
    ///
    /// # Panics
    ///
    /// Panics if the barrier has already resolved: the run is over and the
    /// job could never be accounted for.
    pub fn submit(&self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            {
                let mut barrier = self.shared.barrier.lock();
                assert!(
                    !barrier.resolved,
                    "job {} submitted after the dispatcher completed",
                    job.id
                );
                if barrier.no_more_jobs {
                    debug!(job_id = %job.id, "job submitted after no_more_jobs");
                }
                barrier.in_flight += 1;
            }
            self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

            let algo = job.algo();
            self.shared.running.insert(
                job.id,
                RunningJob {
                    job_id: job.id,
                    algo,
                    attempt: job.attempt,
                    started_at: Utc::now(),
                },
            );
            info!(job_id = %job.id, %algo, attempt = job.attempt, "job submitted");

            let span = info_span!("job", job_id = %job.id, %algo);
            let dispatcher = self.clone();
            self.shared
                .runtime
                .spawn(async move { dispatcher.execute(job).await }.instrument(span));
        }
    }

    /// Declare that no further jobs will be submitted. Idempotent.
    pub fn no_more_jobs(&self) {
        {
            let mut barrier = self.shared.barrier.lock();
            if barrier.no_more_jobs {
                return;
            }
            barrier.no_more_jobs = true;
        }
        debug!("no more jobs");
        self.attempt_complete();
    }

    /// Wait until submissions are closed and every job's result has been
    /// handled by the feeder.
    pub async fn await_completion(&self) {
        let mut done_rx = self.shared.done_tx.subscribe();
        // The sender lives in `shared`, which `self` keeps alive.
        let _ = done_rx.wait_for(|done| *done).await;
    }

    pub fn is_complete(&self) -> bool {
        self.shared.barrier.lock().resolved
    }

    pub fn in_flight(&self) -> usize {
        self.shared.barrier.lock().in_flight
    }

    pub fn stats(&self) -> DispatchStats {
        let counters = &self.shared.counters;
        DispatchStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            barrier_resolutions: counters.resolutions.load(Ordering::Relaxed),
        }
    }

    /// Jobs still training (their feeder callback has not started yet).
    pub fn running_jobs(&self) -> Vec<RunningJob> {
        self.shared
            .running
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn execute(self, job: Job) {
        let job_id = job.id;
        let algo = job.algo();
        let attempt = job.attempt;
        let parameters = job.parameters.clone();
        let started = Instant::now();

        // Train on a separate task so a panicking runner still yields a result.
        let runner = Arc::clone(&self.shared.runner);
        let outcome = match tokio::spawn(async move { runner.train(&job).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_cancelled() => Err(TrainingError::Cancelled),
            Err(join_err) => Err(TrainingError::Panicked {
                message: join_err.to_string(),
            }),
        };
        let elapsed = started.elapsed();
        self.shared.running.remove(&job_id);

        let result = match outcome {
            Ok(artifact) => {
                self.shared.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(?elapsed, "job finished");
                JobResult::Success(JobSuccess {
                    job_id,
                    algo,
                    artifact,
                    elapsed,
                })
            }
            Err(cause) => {
                self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %cause, ?elapsed, "job failed");
                JobResult::Failure(JobFailure {
                    job_id,
                    algo,
                    cause,
                    parameters,
                    attempt,
                    elapsed,
                })
            }
        };

        // Decrements in_flight when dropped, even if the feeder panics.
        let _delivery = Delivery { dispatcher: &self };
        (self.shared.feeder)(result, &self);
    }

    fn finish_delivery(&self) {
        self.shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
        {
            let mut barrier = self.shared.barrier.lock();
            debug_assert!(barrier.in_flight > 0, "in-flight count underflow");
            barrier.in_flight = barrier.in_flight.saturating_sub(1);
        }
        self.attempt_complete();
    }

    fn attempt_complete(&self) {
        let resolved_now = {
            let mut barrier = self.shared.barrier.lock();
            if barrier.no_more_jobs && barrier.in_flight == 0 && !barrier.resolved {
                barrier.resolved = true;
                true
            } else {
                false
            }
        };

        if resolved_now {
            let previous = self.shared.counters.resolutions.fetch_add(1, Ordering::AcqRel);
            assert_eq!(previous, 0, "dispatcher barrier resolved twice");
            self.shared.done_tx.send_replace(true);
            info!(
                jobs = self.shared.counters.submitted.load(Ordering::Relaxed),
                elapsed = ?self.shared.started.elapsed(),
                "all jobs finished"
            );
        }
    }
}

/// Marks one job result as handled by the feeder.
struct Delivery<'a, R: TrainingRunner> {
    dispatcher: &'a Dispatcher<R>,
}

impl<R: TrainingRunner> Drop for Delivery<'_, R> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("feeder panicked while handling a job result");
        }
        self.dispatcher.finish_delivery();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use pf_types::{AlgoParameters, DatasetHandle};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Fails every job whose seed is odd, after `delay`.
    struct ParityRunner {
        delay: Duration,
    }

    #[async_trait]
    impl TrainingRunner for ParityRunner {
        type Artifact = i64;

        async fn train(&self, job: &Job) -> Result<i64, TrainingError> {
            tokio::time::sleep(self.delay).await;
            let seed = job.parameters.common().seed;
            if seed % 2 == 0 {
                Ok(seed)
            } else {
                Err(TrainingError::Failed {
                    message: format!("odd seed {seed}"),
                })
            }
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl TrainingRunner for PanickingRunner {
        type Artifact = ();

        async fn train(&self, _job: &Job) -> Result<(), TrainingError> {
            panic!("runner exploded");
        }
    }

    fn job_with_seed(seed: i64) -> Job {
        let mut params = AlgoParameters::defaults(Algo::Gbm);
        params.common_mut().seed = seed;
        Job::new(params, DatasetHandle::new("train.hex", 1000, 10))
    }

    fn parity(delay_ms: u64) -> Arc<ParityRunner> {
        Arc::new(ParityRunner {
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[tokio::test]
    async fn no_more_jobs_without_submissions_completes_immediately() {
        let dispatcher = Dispatcher::new(parity(1), |_result, _d| {}).unwrap();
        dispatcher.no_more_jobs();
        dispatcher.await_completion().await;
        assert!(dispatcher.is_complete());
        assert_eq!(dispatcher.stats().barrier_resolutions, 1);
    }

    #[tokio::test]
    async fn no_more_jobs_is_idempotent() {
        let dispatcher = Dispatcher::new(parity(1), |_result, _d| {}).unwrap();
        dispatcher.no_more_jobs();
        dispatcher.no_more_jobs();
        dispatcher.await_completion().await;
        assert_eq!(dispatcher.stats().barrier_resolutions, 1);
    }

    #[tokio::test]
    async fn feeder_called_once_per_job() {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::new(parity(5), move |result, _d| {
            sink.lock().push(result.job_id());
        })
        .unwrap();

        let jobs: Vec<Job> = (0..10).map(job_with_seed).collect();
        let mut expected: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        dispatcher.submit(jobs.into_iter().take(4));
        dispatcher.submit(Vec::<Job>::new());
        let rest: Vec<Job> = (10..16).map(job_with_seed).collect();
        expected.truncate(4);
        expected.extend(rest.iter().map(|j| j.id));
        dispatcher.submit(rest);
        dispatcher.no_more_jobs();
        dispatcher.await_completion().await;

        let mut seen = seen.lock().clone();
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);

        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.delivered, 10);
        assert_eq!(stats.succeeded + stats.failed, 10);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn barrier_waits_for_no_more_jobs() {
        let dispatcher = Dispatcher::new(parity(1), |_result, _d| {}).unwrap();
        dispatcher.submit(vec![job_with_seed(2)]);

        let waited = tokio::time::timeout(Duration::from_millis(100), dispatcher.await_completion()).await;
        assert!(waited.is_err(), "barrier resolved before no_more_jobs");
        assert_eq!(dispatcher.stats().delivered, 1);
        assert!(!dispatcher.is_complete());

        dispatcher.no_more_jobs();
        dispatcher.await_completion().await;
        assert!(dispatcher.is_complete());
    }

    #[tokio::test]
    async fn barrier_waits_for_in_flight_jobs() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let dispatcher = Dispatcher::new(parity(50), move |_result, _d| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        dispatcher.submit((0..3).map(job_with_seed));
        dispatcher.no_more_jobs();
        assert!(!dispatcher.is_complete());
        assert_eq!(dispatcher.running_jobs().len(), 3);

        dispatcher.await_completion().await;
        assert_eq!(delivered.load(Ordering::SeqCst), 3);
        assert!(dispatcher.running_jobs().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failures_are_refed_up_to_a_cap() {
        const EXTRA_CAP: usize = 3;

        struct FeedState {
            extra_submitted: usize,
            outstanding: usize,
            results: usize,
        }

        let state = Arc::new(PlMutex::new(FeedState {
            extra_submitted: 0,
            outstanding: 5,
            results: 0,
        }));
        let feed = Arc::clone(&state);
        let dispatcher = Dispatcher::new(parity(10), move |result, d| {
            let mut s = feed.lock();
            s.results += 1;
            s.outstanding -= 1;
            if let JobResult::Failure(failure) = result {
                if s.extra_submitted < EXTRA_CAP {
                    s.extra_submitted += 1;
                    s.outstanding += 1;
                    // Same odd seed: the replacement fails again.
                    d.submit(vec![failure.retry(DatasetHandle::new("train.hex", 1000, 10), None)]);
                }
            }
            if s.outstanding == 0 {
                d.no_more_jobs();
            }
        })
        .unwrap();

        // Seeds 1, 3 fail; 0, 2, 4 succeed.
        dispatcher.submit((0..5).map(job_with_seed));
        dispatcher.await_completion().await;

        let s = state.lock();
        assert_eq!(s.extra_submitted, EXTRA_CAP);
        assert_eq!(s.results, 5 + EXTRA_CAP);
        let stats = dispatcher.stats();
        assert_eq!(stats.delivered, 5 + EXTRA_CAP);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 2 + EXTRA_CAP);
        assert_eq!(stats.barrier_resolutions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn barrier_resolves_once_under_concurrent_completion() {
        for _ in 0..20 {
            let completions = Arc::new(AtomicUsize::new(0));
            let dispatcher = Dispatcher::new(parity(0), |_result, _d| {}).unwrap();
            dispatcher.submit((0..64).map(|i| job_with_seed(i * 2)));
            dispatcher.no_more_jobs();

            let waiters: Vec<_> = (0..4)
                .map(|_| {
                    let d = dispatcher.clone();
                    let c = Arc::clone(&completions);
                    tokio::spawn(async move {
                        d.await_completion().await;
                        c.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .collect();
            for waiter in waiters {
                waiter.await.unwrap();
            }

            assert_eq!(completions.load(Ordering::SeqCst), 4);
            let stats = dispatcher.stats();
            assert_eq!(stats.barrier_resolutions, 1);
            assert_eq!(stats.delivered, 64);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn follow_up_submitted_in_callback_keeps_barrier_open() {
        // The first result's callback sleeps before submitting a follow-up,
        // while no_more_jobs has already been called elsewhere.
        let followed_up = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&followed_up);
        let dispatcher = Dispatcher::new(parity(1), move |result, d| {
            if result.is_success() && !flag.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
                d.submit(vec![job_with_seed(100)]);
            }
        })
        .unwrap();

        dispatcher.submit(vec![job_with_seed(0)]);
        dispatcher.no_more_jobs();
        dispatcher.await_completion().await;

        assert!(followed_up.load(Ordering::SeqCst));
        assert_eq!(dispatcher.stats().delivered, 2);
    }

    #[tokio::test]
    async fn panicking_runner_is_reported_as_failure() {
        let failures = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        let dispatcher = Dispatcher::new(Arc::new(PanickingRunner), move |result, d| {
            if let JobResult::Failure(failure) = result {
                sink.lock().push(failure.cause);
            }
            d.no_more_jobs();
        })
        .unwrap();

        dispatcher.submit(vec![job_with_seed(0)]);
        dispatcher.await_completion().await;

        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], TrainingError::Panicked { .. }));
    }

    #[tokio::test]
    async fn failure_carries_parameters_used() {
        let captured = Arc::new(PlMutex::new(None));
        let sink = Arc::clone(&captured);
        let dispatcher = Dispatcher::new(parity(1), move |result, _d| {
            if let JobResult::Failure(failure) = result {
                *sink.lock() = Some(failure);
            }
        })
        .unwrap();

        let job = job_with_seed(7);
        let params = job.parameters.clone();
        dispatcher.submit(vec![job]);
        dispatcher.no_more_jobs();
        dispatcher.await_completion().await;

        let failure = captured.lock().take().unwrap();
        assert_eq!(failure.parameters, params);
        assert_eq!(failure.algo, Algo::Gbm);
        assert_eq!(failure.attempt, 1);
    }

    #[tokio::test]
    #[should_panic(expected = "submitted after the dispatcher completed")]
    async fn submit_after_completion_panics() {
        let dispatcher = Dispatcher::new(parity(1), |_result, _d| {}).unwrap();
        dispatcher.no_more_jobs();
        dispatcher.await_completion().await;
        dispatcher.submit(vec![job_with_seed(0)]);
    }

    #[test]
    fn new_outside_runtime_is_an_error() {
        let result = Dispatcher::new(parity(1), |_result, _d| {});
        assert!(matches!(result, Err(DispatchError::NoRuntime)));
    }
}
