//! Queue and dead-letter persistence.
//!
//! The store is the sole owner of job state. Every operation that moves a job
//! between the primary queue and the dead-letter partitions is a single atomic
//! store operation, so a job is always in exactly one place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use jobward_core::{EntryId, JobId};

use crate::dead_letter::DeadLetterEntry;
use crate::job::{ClaimedJob, JobDescriptor, JobLocation, Lease};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryQueueStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueueStore;

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("dead-letter entry not found: {0}")]
    EntryNotFound(EntryId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("lease on job {0} is no longer held")]
    LeaseLost(JobId),
    #[error("dead-letter entry {0} is not quarantined")]
    NotQuarantined(EntryId),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Backend(String),
}

/// A job whose lease expired, re-leased to the worker that found it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredClaim {
    pub claimed: ClaimedJob,
    /// The lease that ran out.
    pub expired: Lease,
}

/// Jobs in one primary queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepth {
    pub waiting: usize,
    pub running: usize,
}

/// Backing store for the primary queue and the dead-letter store.
///
/// Implementations must make `claim_next`, `claim_expired_lease`,
/// `move_to_dead_letter`, `promote_due_scheduled` and `requeue_quarantined`
/// atomic with respect to each other.
pub trait QueueStore: Send + Sync {
    /// Add a job to its queue; visible once `now + delay` passes.
    fn enqueue(&self, job: JobDescriptor, now: DateTime<Utc>) -> Result<JobId, StoreError>;

    /// Lease the next ready job of `queue`: highest priority, then earliest
    /// ready time, then insertion order. Increments `attempts_made`.
    fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, StoreError>;

    /// Push back the expiry of a lease the caller still holds.
    fn extend_lease(
        &self,
        job_id: JobId,
        token: Uuid,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, StoreError>;

    /// Remove a successfully finished job.
    fn complete(&self, job_id: JobId, token: Uuid) -> Result<(), StoreError>;

    /// Move a leased job into the dead-letter partition named by `entry.status`.
    fn move_to_dead_letter(&self, job_id: JobId, token: Uuid, entry: DeadLetterEntry) -> Result<(), StoreError>;

    /// Take over one job of `queue` whose lease expired before `now`.
    fn claim_expired_lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiredClaim>, StoreError>;

    /// Move the earliest due scheduled entry back into its primary queue.
    fn promote_due_scheduled(&self, now: DateTime<Utc>) -> Result<Option<JobDescriptor>, StoreError>;

    /// Move a quarantined entry back into its primary queue with a fresh retry budget.
    fn requeue_quarantined(&self, entry_id: EntryId, now: DateTime<Utc>) -> Result<JobDescriptor, StoreError>;

    fn get_entry(&self, entry_id: EntryId) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// All dead-letter entries, optionally for one queue, in no particular order.
    fn list_entries(&self, queue: Option<&str>) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Delete quarantined entries that failed before `cutoff`; returns them.
    fn purge_quarantined_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeadLetterEntry>, StoreError>;

    fn count_quarantined(&self, queue: &str) -> Result<usize, StoreError>;

    /// Every place the job is found. Exactly one element for a live job.
    fn locate_job(&self, job_id: JobId) -> Result<Vec<JobLocation>, StoreError>;

    fn queue_depth(&self, queue: &str) -> Result<QueueDepth, StoreError>;
}

impl<S> QueueStore for Arc<S>
where
    S: QueueStore + ?Sized,
{
    fn enqueue(&self, job: JobDescriptor, now: DateTime<Utc>) -> Result<JobId, StoreError> {
        (**self).enqueue(job, now)
    }

    fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        (**self).claim_next(queue, worker_id, lease_for, now)
    }

    fn extend_lease(
        &self,
        job_id: JobId,
        token: Uuid,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, StoreError> {
        (**self).extend_lease(job_id, token, lease_for, now)
    }

    fn complete(&self, job_id: JobId, token: Uuid) -> Result<(), StoreError> {
        (**self).complete(job_id, token)
    }

    fn move_to_dead_letter(&self, job_id: JobId, token: Uuid, entry: DeadLetterEntry) -> Result<(), StoreError> {
        (**self).move_to_dead_letter(job_id, token, entry)
    }

    fn claim_expired_lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiredClaim>, StoreError> {
        (**self).claim_expired_lease(queue, worker_id, lease_for, now)
    }

    fn promote_due_scheduled(&self, now: DateTime<Utc>) -> Result<Option<JobDescriptor>, StoreError> {
        (**self).promote_due_scheduled(now)
    }

    fn requeue_quarantined(&self, entry_id: EntryId, now: DateTime<Utc>) -> Result<JobDescriptor, StoreError> {
        (**self).requeue_quarantined(entry_id, now)
    }

    fn get_entry(&self, entry_id: EntryId) -> Result<Option<DeadLetterEntry>, StoreError> {
        (**self).get_entry(entry_id)
    }

    fn list_entries(&self, queue: Option<&str>) -> Result<Vec<DeadLetterEntry>, StoreError> {
        (**self).list_entries(queue)
    }

    fn purge_quarantined_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeadLetterEntry>, StoreError> {
        (**self).purge_quarantined_before(cutoff)
    }

    fn count_quarantined(&self, queue: &str) -> Result<usize, StoreError> {
        (**self).count_quarantined(queue)
    }

    fn locate_job(&self, job_id: JobId) -> Result<Vec<JobLocation>, StoreError> {
        (**self).locate_job(job_id)
    }

    fn queue_depth(&self, queue: &str) -> Result<QueueDepth, StoreError> {
        (**self).queue_depth(queue)
    }
}
