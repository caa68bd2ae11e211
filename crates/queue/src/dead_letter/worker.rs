//! DLQ workers: move due Scheduled entries back into their primary queue.

use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::job::JobDescriptor;
use crate::store::{QueueStore, StoreError};
use crate::worker::{WorkerPoolHandle, spawn_pool};

/// Default number of DLQ worker threads.
pub const DEFAULT_DLQ_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterWorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for DeadLetterWorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_DLQ_CONCURRENCY,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Requeue one due Scheduled entry, if any.
pub fn promote_once<S: QueueStore + ?Sized>(store: &S, now: DateTime<Utc>) -> Result<Option<JobDescriptor>, StoreError> {
    let job = store.promote_due_scheduled(now)?;
    if let Some(job) = &job {
        info!(
            job_id = %job.id,
            queue = %job.queue,
            attempts = job.attempts_made,
            source_entry = ?job.metadata.source_entry,
            "scheduled retry requeued"
        );
    }
    Ok(job)
}

/// Requeue every entry due at `now`; returns how many moved.
pub fn promote_all_due<S: QueueStore + ?Sized>(store: &S, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let mut promoted = 0;
    while promote_once(store, now)?.is_some() {
        promoted += 1;
    }
    if promoted > 0 {
        debug!(promoted, "promoted due scheduled entries");
    }
    Ok(promoted)
}

/// Start the DLQ worker pool.
pub fn spawn_dead_letter_workers<S>(store: S, config: &DeadLetterWorkerConfig) -> io::Result<WorkerPoolHandle>
where
    S: QueueStore + 'static,
{
    spawn_pool("dlq", config.concurrency.max(1), config.poll_interval, move |worker_id, stats| {
        match promote_once(&store, Utc::now()) {
            Ok(Some(_)) => {
                if let Ok(mut s) = stats.lock() {
                    s.entries_promoted += 1;
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(worker_id, error = %e, "failed to promote scheduled entry");
                false
            }
        }
    })
}
