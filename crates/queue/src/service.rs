//! Job service façade.
//!
//! Wires the store, registries, dead-letter queue and monitor together. Built
//! explicitly by the application; there is no process-wide instance.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use jobward_core::{EntryId, JobId};

use crate::config::QueueConfig;
use crate::dead_letter::worker::spawn_dead_letter_workers;
use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use crate::handler::{HandlerRegistry, JobContext, JobResult};
use crate::job::{JobDescriptor, JobLocation, JobOptions};
use crate::monitor::{AlertMonitor, AlertSink, DeadLetterStats, MonitorHandle};
use crate::progress::ProgressSink;
use crate::recovery::{EntryFilter, ExportFormat, RecoveryError};
use crate::store::{QueueDepth, QueueStore, StoreError};
use crate::strategy::{RegistryError, RetryStrategy, RetryStrategyRegistry};
use crate::worker::{QueueWorker, WorkerPoolHandle};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Entry point for submitting, running and recovering jobs.
pub struct JobService<S> {
    dead_letter: Arc<DeadLetterQueue<S>>,
    strategies: Arc<RetryStrategyRegistry>,
    handlers: Arc<HandlerRegistry>,
    monitor: Arc<AlertMonitor>,
    progress: Arc<dyn ProgressSink>,
    config: QueueConfig,
}

impl<S> JobService<S>
where
    S: QueueStore + Clone + 'static,
{
    pub fn new(
        store: S,
        alert_sink: Arc<dyn AlertSink>,
        progress_sink: Arc<dyn ProgressSink>,
        config: QueueConfig,
    ) -> Self {
        let strategies = Arc::new(RetryStrategyRegistry::new());
        let monitor = Arc::new(AlertMonitor::new(alert_sink, config.monitor()));
        let dead_letter = Arc::new(DeadLetterQueue::new(store, strategies.clone(), monitor.clone()));
        Self {
            dead_letter,
            strategies,
            handlers: Arc::new(HandlerRegistry::new()),
            monitor,
            progress: progress_sink,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        self.dead_letter.store()
    }

    pub fn dead_letter(&self) -> &Arc<DeadLetterQueue<S>> {
        &self.dead_letter
    }

    pub fn monitor(&self) -> &Arc<AlertMonitor> {
        &self.monitor
    }

    /// Add a job to `queue`.
    pub fn submit(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, ServiceError> {
        self.submit_at(queue, job_type, payload, options, Utc::now())
    }

    /// [`submit`](Self::submit) with an explicit clock.
    pub fn submit_at(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Result<JobId, ServiceError> {
        let job = JobDescriptor::new(queue, job_type, payload, &options);
        let id = self.store().enqueue(job, now)?;
        info!(
            job_id = %id,
            queue,
            job_type,
            priority = options.priority,
            delay_ms = options.delay.as_millis() as u64,
            "job submitted"
        );
        Ok(id)
    }

    pub fn register_retry_strategy(&self, name: &str, strategy: RetryStrategy) -> Result<(), ServiceError> {
        Ok(self.strategies.register(name, strategy)?)
    }

    /// Use the registered strategy `name` for jobs on `queue`.
    pub fn bind_queue_strategy(&self, queue: &str, name: &str) -> Result<(), ServiceError> {
        Ok(self.strategies.register_for_queue(queue, name)?)
    }

    pub fn register_handler<F>(&self, pattern: &str, handler: F)
    where
        F: Fn(&JobContext<'_>) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.register(pattern, handler);
    }

    pub fn set_alert_threshold(&self, queue: &str, threshold: usize) {
        self.monitor.set_threshold(queue, threshold);
    }

    /// A worker for `queue`, for driving `process_next` by hand.
    pub fn worker(&self, queue: &str) -> QueueWorker<S> {
        QueueWorker::new(
            queue,
            self.handlers.clone(),
            self.dead_letter.clone(),
            self.progress.clone(),
            self.config.worker(),
        )
    }

    /// Start `concurrency` worker threads on `queue`.
    pub fn consume(&self, queue: &str, concurrency: usize) -> Result<WorkerPoolHandle, ServiceError> {
        Ok(Arc::new(self.worker(queue)).spawn(concurrency)?)
    }

    /// Start the pool that requeues due Scheduled entries.
    pub fn start_dead_letter_workers(&self) -> Result<WorkerPoolHandle, ServiceError> {
        Ok(spawn_dead_letter_workers(
            self.store().clone(),
            &self.config.dead_letter_workers(),
        )?)
    }

    /// Start the periodic dead-letter health sweep.
    pub fn start_monitor(&self) -> Result<MonitorHandle, ServiceError> {
        Ok(self.monitor.clone().spawn_sweeper(self.store().clone())?)
    }

    pub fn get_stats(&self) -> Result<DeadLetterStats, ServiceError> {
        Ok(self.dead_letter.get_stats()?)
    }

    pub fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<DeadLetterEntry>, ServiceError> {
        Ok(self.dead_letter.get_entries(filter)?)
    }

    pub fn get_entry(&self, entry_id: EntryId) -> Result<Option<DeadLetterEntry>, ServiceError> {
        Ok(self.store().get_entry(entry_id)?)
    }

    pub fn manual_retry(&self, entry_id: EntryId) -> Result<JobId, ServiceError> {
        Ok(self.dead_letter.manual_retry(entry_id, Utc::now())?)
    }

    pub fn purge_old_entries(&self, max_age: Duration) -> Result<usize, ServiceError> {
        Ok(self.dead_letter.purge_old_entries(max_age, Utc::now())?)
    }

    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, ServiceError> {
        Ok(self.dead_letter.purge_before(cutoff)?)
    }

    pub fn export_data(&self, format: ExportFormat) -> Result<String, ServiceError> {
        Ok(self.dead_letter.export_data(format)?)
    }

    pub fn locate_job(&self, job_id: JobId) -> Result<Vec<JobLocation>, ServiceError> {
        Ok(self.store().locate_job(job_id)?)
    }

    pub fn queue_depth(&self, queue: &str) -> Result<QueueDepth, ServiceError> {
        Ok(self.store().queue_depth(queue)?)
    }
}
