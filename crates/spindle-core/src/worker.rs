//! Worker - N 本の実行ループ
//!
//! Each loop: lease → execute → ack / fail. Nothing due: sleep one poll
//! interval (or exit, with `stop_when_empty`).
//!
//! Stopping is cooperative. The shared [`CancellationToken`] is checked at the
//! top of every iteration and interrupts the idle sleep, but never an
//! in-flight execution; bounding a single job is the executor's timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SpindleConfig;
use crate::domain::{JobId, JobState};
use crate::error::{Result, SpindleError};
use crate::ports::{Executor, JobSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Exit a loop as soon as it finds nothing due.
    pub stop_when_empty: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
            stop_when_empty: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &SpindleConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            poll_interval: config.poll_interval(),
            stop_when_empty: false,
        }
    }

    pub fn stop_when_empty(mut self, stop_when_empty: bool) -> Self {
        self.stop_when_empty = stop_when_empty;
        self
    }
}

/// Something went wrong around a job that the loop could not apply.
///
/// `execution_error` is set when the job itself had failed and recording that
/// failure is what broke; `source` is the storage / state-machine error.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct WorkerError {
    pub job_id: Option<JobId>,
    pub execution_error: Option<String>,
    pub source: SpindleError,
}

pub type ErrorHook = Arc<dyn Fn(WorkerError) + Send + Sync>;

#[derive(Debug, Default)]
pub struct WorkerStats {
    leased: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub leased: u64,
    pub succeeded: u64,
    /// Failures with retries left.
    pub failed: u64,
    pub dead_lettered: u64,
    pub errors: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            leased: self.leased.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Worker {
    source: Arc<dyn JobSource>,
    executor: Arc<dyn Executor>,
    config: WorkerConfig,
    on_error: Option<ErrorHook>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(source: Arc<dyn JobSource>, executor: Arc<dyn Executor>, config: WorkerConfig) -> Self {
        Self {
            source,
            executor,
            config,
            on_error: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn on_error(mut self, hook: impl Fn(WorkerError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Share an externally owned token (e.g. cancelled on Ctrl-C).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Spawn the loops.
    pub fn start(self) -> Result<WorkerHandle> {
        if self.config.concurrency == 0 {
            return Err(SpindleError::Validation("worker concurrency must be at least 1".into()));
        }

        let stats = Arc::new(WorkerStats::default());
        let ctx = Arc::new(LoopContext {
            source: self.source,
            executor: self.executor,
            poll_interval: self.config.poll_interval,
            stop_when_empty: self.config.stop_when_empty,
            on_error: self.on_error,
            cancel: self.cancel.clone(),
            stats: Arc::clone(&stats),
        });

        let joins = (0..self.config.concurrency)
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move { ctx.run(worker_id).await })
            })
            .collect();

        info!(concurrency = self.config.concurrency, "worker started");
        Ok(WorkerHandle {
            cancel: self.cancel,
            joins,
            stats,
        })
    }
}

/// Handle to running loops.
/// - `stop()`: cancel + 全ループの終了を待つ
/// - `join()`: 自然終了 (stop_when_empty) を待つ
pub struct WorkerHandle {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    /// Stop taking new leases; in-flight jobs still finish.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.joins.iter().all(JoinHandle::is_finished)
    }

    pub async fn stop(self) -> WorkerStatsSnapshot {
        self.request_stop();
        self.join().await
    }

    pub async fn join(self) -> WorkerStatsSnapshot {
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker loop panicked");
            }
        }
        let stats = self.stats.snapshot();
        info!(?stats, "worker stopped");
        stats
    }
}

struct LoopContext {
    source: Arc<dyn JobSource>,
    executor: Arc<dyn Executor>,
    poll_interval: Duration,
    stop_when_empty: bool,
    on_error: Option<ErrorHook>,
    cancel: CancellationToken,
    stats: Arc<WorkerStats>,
}

impl LoopContext {
    async fn run(&self, worker_id: usize) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let lease = match self.source.lease().await {
                Ok(lease) => lease,
                Err(e) => {
                    self.report(WorkerError {
                        job_id: None,
                        execution_error: None,
                        source: e,
                    });
                    if self.idle().await {
                        continue;
                    }
                    break;
                }
            };

            let Some(lease) = lease else {
                if self.stop_when_empty {
                    debug!(worker_id, "nothing due, stopping");
                    break;
                }
                if self.idle().await {
                    continue;
                }
                break;
            };

            WorkerStats::bump(&self.stats.leased);
            // 実行に必要な分だけ owned にする (lease は ack/fail で消費)
            let job = lease.job().clone();
            info!(worker_id, job_id = %job.id(), attempt = job.attempts() + 1, "job leased");

            match self.executor.execute(&job).await {
                Ok(()) => match lease.ack().await {
                    Ok(_) => WorkerStats::bump(&self.stats.succeeded),
                    Err(e) => self.report(WorkerError {
                        job_id: Some(job.id().clone()),
                        execution_error: None,
                        source: e,
                    }),
                },
                Err(exec_err) => {
                    let message = exec_err.to_string();
                    // retry / dead の判断は job の backoff policy 側
                    match lease.fail(message.clone()).await {
                        Ok(failed) if failed.state() == JobState::Dead => {
                            WorkerStats::bump(&self.stats.dead_lettered)
                        }
                        Ok(_) => WorkerStats::bump(&self.stats.failed),
                        Err(e) => self.report(WorkerError {
                            job_id: Some(job.id().clone()),
                            execution_error: Some(message),
                            source: e,
                        }),
                    }
                }
            }
        }
        debug!(worker_id, "worker loop exited");
    }

    /// Sleep one poll interval. `false` if cancelled meanwhile.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }

    fn report(&self, err: WorkerError) {
        WorkerStats::bump(&self.stats.errors);
        match &self.on_error {
            Some(hook) => {
                warn!(job_id = ?err.job_id, error = %err.source, "worker error");
                hook(err);
            }
            None => error!(
                job_id = ?err.job_id,
                execution_error = ?err.execution_error,
                error = %err.source,
                "worker error (no hook installed)"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Job, JobOptions};
    use crate::ports::{Clock, FixedClock, JobLease};
    use crate::queue::{Queue, SharedQueue};
    use crate::storage::{MemoryStorage, Storage, StorageSource};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Fails any command containing "fail", succeeds otherwise.
    #[derive(Default)]
    struct ScriptedExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(&self, job: &Job) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if job.command().contains("fail") {
                return Err(SpindleError::Execution("exit code 1: scripted".into()));
            }
            Ok(())
        }
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()))
    }

    fn config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            poll_interval: Duration::from_millis(10),
            stop_when_empty: true,
        }
    }

    #[tokio::test]
    async fn drains_the_queue_then_stops() {
        let clock = clock();
        let queue = SharedQueue::new(Queue::new(), clock.clone());
        for _ in 0..10 {
            queue.enqueue(Job::create("ok", JobOptions::default(), clock.now()).unwrap()).await.unwrap();
        }
        let executor = Arc::new(ScriptedExecutor::default());

        let stats = Worker::new(Arc::new(queue.clone()), executor.clone(), config(3))
            .start()
            .unwrap()
            .join()
            .await;

        assert_eq!(stats.leased, 10);
        assert_eq!(stats.succeeded, 10);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 10);
        assert_eq!(queue.list(Some(JobState::Completed)).await.len(), 10);
    }

    #[tokio::test]
    async fn failures_are_scheduled_or_dead_lettered() {
        let clock = clock();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let retrying = Job::create("fail-soft", JobOptions::default().max_retries(2), clock.now()).unwrap();
        let doomed = Job::create("fail-hard", JobOptions::default().max_retries(0), clock.now()).unwrap();
        storage.enqueue(retrying.clone()).await.unwrap();
        storage.enqueue(doomed.clone()).await.unwrap();

        let source = StorageSource::new(storage.clone(), clock.clone());
        let stats = Worker::new(Arc::new(source), Arc::new(ScriptedExecutor::default()), config(1))
            .start()
            .unwrap()
            .join()
            .await;

        // the clock never moves, so the retry is not due again
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dead_lettered, 1);
        let stored = storage.get_by_id(retrying.id()).await.unwrap().unwrap();
        assert_eq!(stored.state(), JobState::Failed);
        assert_eq!(stored.last_error(), Some("exit code 1: scripted"));
        assert_eq!(storage.list_dlq().await.unwrap().len(), 1);
        assert!(storage.get_by_id(doomed.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_interrupts_the_idle_wait() {
        let queue = SharedQueue::new(Queue::new(), clock());
        let config = WorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_secs(60),
            stop_when_empty: false,
        };
        let handle = Worker::new(Arc::new(queue), Arc::new(ScriptedExecutor::default()), config)
            .start()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        let stats = tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .expect("stop should not wait for the poll interval");
        assert_eq!(stats.leased, 0);
    }

    /// Signals when it starts, then takes a while.
    struct SlowExecutor {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl Executor for SlowExecutor {
        async fn execute(&self, _job: &Job) -> Result<()> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_lets_the_in_flight_job_finish() {
        let clock = clock();
        let queue = SharedQueue::new(Queue::new(), clock.clone());
        let job = Job::create("slow", JobOptions::default(), clock.now()).unwrap();
        queue.enqueue(job.clone()).await.unwrap();

        let started = Arc::new(Notify::new());
        let executor = Arc::new(SlowExecutor { started: started.clone() });
        let handle = Worker::new(
            Arc::new(queue.clone()),
            executor,
            WorkerConfig { stop_when_empty: false, ..config(1) },
        )
        .start()
        .unwrap();

        started.notified().await;
        let stats = handle.stop().await;
        assert_eq!(stats.succeeded, 1);
        assert_eq!(queue.get(job.id()).await.unwrap().state(), JobState::Completed);
    }

    /// Hands out one lease whose finalisation always breaks.
    struct BrokenSource {
        job: Mutex<Option<Job>>,
    }

    struct BrokenLease(Job);

    #[async_trait]
    impl JobLease for BrokenLease {
        fn job(&self) -> &Job {
            &self.0
        }

        async fn ack(self: Box<Self>) -> Result<Job> {
            Err(SpindleError::not_found(self.0.id()))
        }

        async fn fail(self: Box<Self>, _error: String) -> Result<Job> {
            Err(SpindleError::IllegalTransition {
                id: self.0.id().clone(),
                from: JobState::Completed,
                action: "mark failed",
            })
        }
    }

    #[async_trait]
    impl JobSource for BrokenSource {
        async fn lease(&self) -> Result<Option<Box<dyn JobLease>>> {
            let job = self.job.lock().unwrap().take();
            Ok(job.map(|job| Box::new(BrokenLease(job)) as Box<dyn JobLease>))
        }
    }

    #[tokio::test]
    async fn finalisation_errors_go_to_the_hook() {
        let clock = clock();
        let mut job = Job::create("fail", JobOptions::default(), clock.now()).unwrap();
        job.mark_processing(clock.now()).unwrap();
        let source = BrokenSource { job: Mutex::new(Some(job.clone())) };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let stats = Worker::new(Arc::new(source), Arc::new(ScriptedExecutor::default()), config(1))
            .on_error(move |err| sink.lock().unwrap().push(err))
            .start()
            .unwrap()
            .join()
            .await;

        assert_eq!(stats.errors, 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].job_id.as_ref(), Some(job.id()));
        assert_eq!(seen[0].execution_error.as_deref(), Some("exit code 1: scripted"));
        assert!(seen[0].source.is_contract_violation());
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let queue = SharedQueue::new(Queue::new(), clock());
        let result = Worker::new(Arc::new(queue), Arc::new(ScriptedExecutor::default()), config(0)).start();
        assert!(result.is_err());
    }
}
