//! Primary queue workers.
//!
//! Each worker is an OS thread that claims one job at a time from its queue,
//! runs the registered handler and either completes the job or hands the
//! failure to the dead-letter queue. While a handler runs, a companion thread
//! renews its lease every third of the lease duration. Before claiming new
//! work a worker takes over one job whose lease expired (a crashed worker)
//! and routes it through the same failure path.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use jobward_core::{JobError, JobId};

use crate::dead_letter::{DeadLetterError, DeadLetterQueue, FailureContext, FailureOutcome};
use crate::handler::{HandlerRegistry, Heartbeat, JobContext, JobResult};
use crate::job::ClaimedJob;
use crate::progress::ProgressSink;
use crate::store::{ExpiredClaim, QueueStore, StoreError};

/// Code attached to failures synthesized for jobs whose lease ran out.
pub const LEASE_EXPIRED_CODE: &str = "LeaseExpired";

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// How long a claim stays valid without renewal. Running jobs are renewed
    /// every third of this.
    pub lease_duration: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(300),
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_scheduled: u64,
    pub jobs_quarantined: u64,
    pub leases_reclaimed: u64,
    /// Scheduled entries moved back into their queue (DLQ workers only).
    pub entries_promoted: u64,
    pub current_running: usize,
}

/// Result of one [`QueueWorker::process_next`] call that found work.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Succeeded { job_id: JobId, result: serde_json::Value },
    Failed { job_id: JobId, outcome: FailureOutcome },
    /// A job with an expired lease was taken over and failed.
    Reclaimed { job_id: JobId, outcome: FailureOutcome },
    /// The handler finished but the lease had already been lost.
    LeaseLost { job_id: JobId },
}

/// Worker failure outside of handler code.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}

/// Runs jobs of one queue. Shared by all worker threads of a pool.
pub struct QueueWorker<S> {
    queue: String,
    handlers: Arc<HandlerRegistry>,
    dead_letter: Arc<DeadLetterQueue<S>>,
    progress: Arc<dyn ProgressSink>,
    config: WorkerConfig,
}

impl<S: QueueStore> QueueWorker<S> {
    pub fn new(
        queue: impl Into<String>,
        handlers: Arc<HandlerRegistry>,
        dead_letter: Arc<DeadLetterQueue<S>>,
        progress: Arc<dyn ProgressSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue: queue.into(),
            handlers,
            dead_letter,
            progress,
            config,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn store(&self) -> &S {
        self.dead_letter.store()
    }

    /// Reclaim one expired lease, or else claim and run the next ready job.
    ///
    /// Returns `Ok(None)` when there was nothing to do.
    pub fn process_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<ProcessOutcome>, WorkerError> {
        self.process(worker_id, now, None)
    }

    fn process(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stats: Option<&Mutex<WorkerStats>>,
    ) -> Result<Option<ProcessOutcome>, WorkerError> {
        if let Some(expired) = self
            .store()
            .claim_expired_lease(&self.queue, worker_id, self.config.lease_duration, now)?
        {
            return self.reclaim(expired, now).map(Some);
        }

        let Some(claimed) = self
            .store()
            .claim_next(&self.queue, worker_id, self.config.lease_duration, now)?
        else {
            return Ok(None);
        };
        let _running = RunningGuard::enter(stats);
        self.run(claimed, worker_id, now).map(Some)
    }

    fn reclaim(&self, expired: ExpiredClaim, now: DateTime<Utc>) -> Result<ProcessOutcome, WorkerError> {
        let job_id = expired.claimed.job.id;
        warn!(
            job_id = %job_id,
            queue = %self.queue,
            previous_worker = %expired.expired.worker_id,
            expired_at = %expired.expired.expires_at,
            "reclaiming job with expired lease"
        );
        let error = JobError::untyped(format!(
            "lease held by {} expired at {}",
            expired.expired.worker_id, expired.expired.expires_at
        ))
        .with_code(LEASE_EXPIRED_CODE);
        let ctx = FailureContext {
            worker_id: expired.expired.worker_id.clone(),
            processing_time: (now - expired.expired.claimed_at).to_std().unwrap_or_default(),
        };
        let outcome = self.dead_letter.handle_failure(&expired.claimed, error, &ctx, now)?;
        Ok(ProcessOutcome::Reclaimed { job_id, outcome })
    }

    fn run(&self, claimed: ClaimedJob, worker_id: &str, now: DateTime<Utc>) -> Result<ProcessOutcome, WorkerError> {
        let job = &claimed.job;
        debug!(
            job_id = %job.id,
            queue = %job.queue,
            job_type = %job.job_type,
            attempt = job.attempts_made,
            worker_id,
            "claimed job"
        );

        let started = Instant::now();
        let result = self.execute(&claimed, worker_id);
        let elapsed = started.elapsed();
        let finished = now + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());

        match result {
            Ok(value) => match self.store().complete(job.id, claimed.lease.token) {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        queue = %job.queue,
                        job_type = %job.job_type,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "job completed"
                    );
                    Ok(ProcessOutcome::Succeeded {
                        job_id: job.id,
                        result: value,
                    })
                }
                Err(StoreError::LeaseLost(_) | StoreError::NotFound(_)) => {
                    warn!(job_id = %job.id, queue = %job.queue, "job finished after its lease was lost");
                    Ok(ProcessOutcome::LeaseLost { job_id: job.id })
                }
                Err(e) => Err(e.into()),
            },
            Err(error) => {
                debug!(job_id = %job.id, error = %error, "job execution failed");
                let ctx = FailureContext {
                    worker_id: worker_id.to_string(),
                    processing_time: elapsed,
                };
                match self.dead_letter.handle_failure(&claimed, error, &ctx, finished) {
                    Ok(outcome) => Ok(ProcessOutcome::Failed {
                        job_id: job.id,
                        outcome,
                    }),
                    Err(DeadLetterError::Store(StoreError::LeaseLost(_) | StoreError::NotFound(_))) => {
                        warn!(job_id = %job.id, queue = %job.queue, "job failed after its lease was lost");
                        Ok(ProcessOutcome::LeaseLost { job_id: job.id })
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn execute(&self, claimed: &ClaimedJob, worker_id: &str) -> JobResult {
        let job = &claimed.job;
        let Some(handler) = self.handlers.get(&job.job_type) else {
            return Err(JobError::not_found(format!(
                "no handler registered for job type {}",
                job.job_type
            )));
        };

        let token = claimed.lease.token;
        let lease_for = self.config.lease_duration;
        let store = self.store();
        let renew = move || store.extend_lease(job.id, token, lease_for, Utc::now()).map(|_| ());
        let heartbeat: Heartbeat<'_> = &renew;
        let ctx = JobContext::new(job, worker_id, self.progress.as_ref(), heartbeat);

        thread::scope(|scope| {
            let (done_tx, done_rx) = mpsc::channel::<()>();
            let every = (lease_for / 3).max(Duration::from_millis(1));
            let job_id = job.id;
            let renewer = thread::Builder::new()
                .name(format!("{worker_id}-lease"))
                .spawn_scoped(scope, move || keep_alive(heartbeat, every, done_rx, job_id));
            if let Err(e) = renewer {
                warn!(job_id = %job_id, error = %e, "could not start lease renewal; relying on handler heartbeats");
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx))).unwrap_or_else(|payload| {
                Err(JobError::untyped(format!("handler panicked: {}", panic_message(&*payload))))
            });
            drop(done_tx);
            result
        })
    }
}

/// Renew a lease every `every` until `done` fires or the lease is gone.
fn keep_alive(renew: Heartbeat<'_>, every: Duration, done: mpsc::Receiver<()>, job_id: JobId) {
    loop {
        match done.recv_timeout(every) {
            Err(mpsc::RecvTimeoutError::Timeout) => match renew() {
                Ok(()) => {}
                Err(e @ (StoreError::LeaseLost(_) | StoreError::NotFound(_))) => {
                    warn!(job_id = %job_id, error = %e, "lease lost while job was running");
                    return;
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "lease renewal failed"),
            },
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Counts a claimed job in `current_running` for as long as it is held.
struct RunningGuard<'a>(Option<&'a Mutex<WorkerStats>>);

impl<'a> RunningGuard<'a> {
    fn enter(stats: Option<&'a Mutex<WorkerStats>>) -> Self {
        if let Some(Ok(mut s)) = stats.map(Mutex::lock) {
            s.current_running += 1;
        }
        Self(stats)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Some(Ok(mut s)) = self.0.map(Mutex::lock) {
            s.current_running = s.current_running.saturating_sub(1);
        }
    }
}

impl<S: QueueStore + 'static> QueueWorker<S> {
    /// Spawn `concurrency` threads running this worker until shutdown.
    pub fn spawn(self: Arc<Self>, concurrency: usize) -> io::Result<WorkerPoolHandle> {
        let name = self.queue.clone();
        let poll_interval = self.config.poll_interval;
        spawn_pool(&name, concurrency.max(1), poll_interval, move |worker_id, stats| {
            let now = Utc::now();
            match self.process(worker_id, now, Some(stats)) {
                Ok(Some(outcome)) => {
                    record(stats, &outcome);
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    error!(queue = %self.queue, worker_id, error = %e, "worker iteration failed");
                    false
                }
            }
        })
    }
}

fn record(stats: &Mutex<WorkerStats>, outcome: &ProcessOutcome) {
    let Ok(mut s) = stats.lock() else {
        return;
    };
    s.jobs_processed += 1;
    let failure = match outcome {
        ProcessOutcome::Succeeded { .. } => {
            s.jobs_succeeded += 1;
            None
        }
        ProcessOutcome::Failed { outcome, .. } => {
            s.jobs_failed += 1;
            Some(outcome)
        }
        ProcessOutcome::Reclaimed { outcome, .. } => {
            s.leases_reclaimed += 1;
            Some(outcome)
        }
        ProcessOutcome::LeaseLost { .. } => None,
    };
    match failure {
        Some(FailureOutcome::Scheduled { .. }) => s.jobs_scheduled += 1,
        Some(FailureOutcome::Quarantined { .. }) => s.jobs_quarantined += 1,
        None => {}
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug)]
struct WorkerThread {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

/// Handle to control a running pool of worker threads.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    name: String,
    workers: Vec<WorkerThread>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPoolHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.workers.len()
    }

    /// Request graceful shutdown; each worker finishes its in-flight job first.
    pub fn shutdown(mut self) {
        for w in &self.workers {
            let _ = w.shutdown.send(());
        }
        for w in &mut self.workers {
            if let Some(j) = w.join.take() {
                let _ = j.join();
            }
        }
        info!(pool = %self.name, "worker pool stopped");
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Spawn `concurrency` threads calling `step` until shutdown.
///
/// `step` returns whether it did any work; idle threads wait `poll_interval`.
/// Dropping the handle without `shutdown` also stops the threads, without
/// waiting for them.
pub(crate) fn spawn_pool<F>(
    name: &str,
    concurrency: usize,
    poll_interval: Duration,
    step: F,
) -> io::Result<WorkerPoolHandle>
where
    F: Fn(&str, &Mutex<WorkerStats>) -> bool + Send + Sync + 'static,
{
    let step = Arc::new(step);
    let stats = Arc::new(Mutex::new(WorkerStats::default()));
    let mut workers = Vec::with_capacity(concurrency);

    for i in 0..concurrency {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let worker_id = format!("{name}-{i}");
        let step = step.clone();
        let stats = stats.clone();

        let join = thread::Builder::new().name(worker_id.clone()).spawn(move || {
            debug!(worker_id = %worker_id, "worker started");
            loop {
                // Shutdown has priority; a dropped handle counts as shutdown.
                if !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty)) {
                    break;
                }

                let worked = step(worker_id.as_str(), stats.as_ref());

                if !worked {
                    match shutdown_rx.recv_timeout(poll_interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
            debug!(worker_id = %worker_id, "worker stopped");
        })?;

        workers.push(WorkerThread {
            shutdown: shutdown_tx,
            join: Some(join),
        });
    }

    info!(pool = %name, concurrency, "worker pool started");
    Ok(WorkerPoolHandle {
        name: name.to_string(),
        workers,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobDescriptor, JobLocation, JobOptions};
    use crate::monitor::{AlertMonitor, InMemoryAlertSink, MonitorConfig};
    use crate::progress::InMemoryProgressSink;
    use crate::store::InMemoryQueueStore;
    use crate::strategy::RetryStrategyRegistry;

    type Store = Arc<InMemoryQueueStore>;

    fn worker(handlers: HandlerRegistry, config: WorkerConfig) -> (Store, QueueWorker<Store>, Arc<InMemoryProgressSink>) {
        let store = InMemoryQueueStore::arc();
        let monitor = Arc::new(AlertMonitor::new(Arc::new(InMemoryAlertSink::new()), MonitorConfig::default()));
        let dlq = Arc::new(DeadLetterQueue::new(store.clone(), Arc::new(RetryStrategyRegistry::new()), monitor));
        let progress = Arc::new(InMemoryProgressSink::new());
        let worker = QueueWorker::new("import", Arc::new(handlers), dlq, progress.clone(), config);
        (store, worker, progress)
    }

    fn submit(store: &Store, job_type: &str, now: DateTime<Utc>) -> JobId {
        let job = JobDescriptor::new("import", job_type, serde_json::json!({"n": 1}), &JobOptions::new());
        store.enqueue(job, now).unwrap()
    }

    #[test]
    fn successful_job_is_removed() {
        let handlers = HandlerRegistry::new();
        handlers.register("echo", |ctx| {
            ctx.report_progress(100, "done");
            Ok(ctx.payload().clone())
        });
        let (store, worker, progress) = worker(handlers, WorkerConfig::default());
        let now = Utc::now();
        let id = submit(&store, "echo", now);

        let outcome = worker.process_next("w-0", now).unwrap().unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Succeeded {
                job_id: id,
                result: serde_json::json!({"n": 1})
            }
        );
        assert!(store.locate_job(id).unwrap().is_empty());
        assert_eq!(progress.for_job(id).len(), 1);
        assert!(worker.process_next("w-0", now).unwrap().is_none());
    }

    #[test]
    fn missing_handler_is_not_retried() {
        let (store, worker, _) = worker(HandlerRegistry::new(), WorkerConfig::default());
        let now = Utc::now();
        let id = submit(&store, "unknown.type", now);

        let outcome = worker.process_next("w-0", now).unwrap().unwrap();
        let ProcessOutcome::Failed { outcome, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(outcome.is_quarantined());
        let entry = store.get_entry(outcome.entry_id()).unwrap().unwrap();
        assert_eq!(entry.error.code(), Some("NotFoundError"));
        assert_eq!(store.locate_job(id).unwrap(), vec![JobLocation::Quarantined(entry.id)]);
    }

    #[test]
    fn panicking_handler_becomes_a_failure() {
        let handlers = HandlerRegistry::new();
        handlers.register("explode", |_ctx| panic!("kaboom"));
        let (store, worker, _) = worker(handlers, WorkerConfig::default());
        let now = Utc::now();
        submit(&store, "explode", now);

        let outcome = worker.process_next("w-0", now).unwrap().unwrap();
        let ProcessOutcome::Failed { outcome, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        // Unclassified errors get the default strategy, which retries.
        assert!(!outcome.is_quarantined());
        let entry = store.get_entry(outcome.entry_id()).unwrap().unwrap();
        assert!(entry.error.message.contains("kaboom"));
        assert_eq!(entry.error.kind, jobward_core::ErrorKind::Unclassified);
    }

    #[test]
    fn heartbeat_extends_the_lease() {
        let handlers = HandlerRegistry::new();
        handlers.register("slow", |ctx| {
            ctx.heartbeat().map_err(|e| JobError::untyped(e.to_string()))?;
            Ok(serde_json::Value::Null)
        });
        let (store, worker, _) = worker(handlers, WorkerConfig::default());
        let now = Utc::now();
        submit(&store, "slow", now);

        let outcome = worker.process_next("w-0", now).unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Succeeded { .. }));
    }

    #[test]
    fn idle_worker_reclaims_expired_lease() {
        let config = WorkerConfig {
            lease_duration: Duration::from_secs(30),
            ..WorkerConfig::default()
        };
        let (store, worker, _) = worker(HandlerRegistry::new(), config);
        let now = Utc::now();
        let id = submit(&store, "anything", now);

        // A worker claims the job and dies.
        let crashed = store
            .claim_next("import", "crashed", Duration::from_secs(30), now)
            .unwrap()
            .unwrap();

        assert!(worker.process_next("w-0", now).unwrap().is_none());

        let later = now + chrono::Duration::seconds(31);
        let outcome = worker.process_next("w-0", later).unwrap().unwrap();
        let ProcessOutcome::Reclaimed { job_id, outcome } = outcome else {
            panic!("expected reclaim, got {outcome:?}");
        };
        assert_eq!(job_id, id);
        let entry = store.get_entry(outcome.entry_id()).unwrap().unwrap();
        assert_eq!(entry.error.code(), Some(LEASE_EXPIRED_CODE));
        assert_eq!(entry.metadata.worker_id, "crashed");
        assert_eq!(entry.attempts, 1);

        // The original worker's late completion is rejected.
        assert_eq!(
            store.complete(id, crashed.lease.token),
            Err(StoreError::NotFound(id))
        );
    }

    #[test]
    fn long_running_handler_keeps_its_lease() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let runs = Arc::new(AtomicUsize::new(0));
        let handlers = HandlerRegistry::new();
        let counter = runs.clone();
        handlers.register("slow", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(500));
            Ok(serde_json::Value::Null)
        });
        let config = WorkerConfig {
            lease_duration: Duration::from_millis(150),
            ..WorkerConfig::default()
        };
        let (store, worker, _) = worker(handlers, config);
        let id = submit(&store, "slow", Utc::now());

        let first = thread::scope(|scope| {
            let first = scope.spawn(|| worker.process_next("w-0", Utc::now()));
            while store.locate_job(id).unwrap() != vec![JobLocation::Running] {
                thread::sleep(Duration::from_millis(5));
            }
            // Well past the original lease; nobody may take the job over.
            while !first.is_finished() {
                assert!(worker.process_next("w-1", Utc::now()).unwrap().is_none());
                thread::sleep(Duration::from_millis(20));
            }
            first.join().unwrap()
        });

        assert!(matches!(first.unwrap(), Some(ProcessOutcome::Succeeded { .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(store.locate_job(id).unwrap().is_empty());
    }

    #[test]
    fn expired_lease_is_reclaimed_even_when_queue_is_busy() {
        let handlers = HandlerRegistry::new();
        handlers.register("noop", |_ctx| Ok(serde_json::Value::Null));
        let config = WorkerConfig {
            lease_duration: Duration::from_secs(30),
            ..WorkerConfig::default()
        };
        let (store, worker, _) = worker(handlers, config);
        let now = Utc::now();
        let orphan = submit(&store, "noop", now);
        store
            .claim_next("import", "crashed", Duration::from_secs(30), now)
            .unwrap()
            .unwrap();
        for _ in 0..3 {
            submit(&store, "noop", now);
        }

        let later = now + chrono::Duration::seconds(31);
        let outcome = worker.process_next("w-0", later).unwrap().unwrap();
        assert!(
            matches!(outcome, ProcessOutcome::Reclaimed { job_id, .. } if job_id == orphan),
            "expected reclaim first, got {outcome:?}"
        );
        let next = worker.process_next("w-0", later).unwrap().unwrap();
        assert!(matches!(next, ProcessOutcome::Succeeded { .. }));
    }

    #[test]
    fn idle_pool_reports_nothing_running() {
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(1),
            ..WorkerConfig::default()
        };
        let (_store, worker, _) = worker(HandlerRegistry::new(), config);
        let handle = Arc::new(worker).spawn(4).unwrap();

        for _ in 0..50 {
            assert_eq!(handle.stats().current_running, 0);
            thread::sleep(Duration::from_millis(1));
        }
        handle.shutdown();
    }

    #[test]
    fn pool_processes_and_shuts_down() {
        let handlers = HandlerRegistry::new();
        handlers.register("noop", |_ctx| Ok(serde_json::Value::Null));
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(5),
            ..WorkerConfig::default()
        };
        let (store, worker, _) = worker(handlers, config);
        let now = Utc::now();
        let ids: Vec<JobId> = (0..20).map(|_| submit(&store, "noop", now)).collect();

        let handle = Arc::new(worker).spawn(3).unwrap();
        assert_eq!(handle.concurrency(), 3);

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_succeeded < 20 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.jobs_succeeded, 20);
        for id in ids {
            assert!(store.locate_job(id).unwrap().is_empty());
        }
    }
}
