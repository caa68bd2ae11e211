//! In-memory store for tests/dev.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use jobward_core::{EntryId, JobId};

use super::{ExpiredClaim, QueueDepth, QueueStore, StoreError};
use crate::dead_letter::{DeadLetterEntry, EntryStatus};
use crate::job::{ClaimedJob, JobDescriptor, JobLocation, Lease, add_millis};

#[derive(Debug, Clone)]
struct QueuedJob {
    job: JobDescriptor,
    ready_at: DateTime<Utc>,
    /// Insertion order, the last tie-breaker.
    seq: u64,
    lease: Option<Lease>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_seq: u64,
    jobs: HashMap<JobId, QueuedJob>,
    entries: HashMap<EntryId, DeadLetterEntry>,
    entry_by_job: HashMap<JobId, EntryId>,
}

impl StoreState {
    fn contains_job(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id) || self.entry_by_job.contains_key(&job_id)
    }

    fn push_job(&mut self, job: JobDescriptor, ready_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(
            job.id,
            QueuedJob {
                job,
                ready_at,
                seq,
                lease: None,
            },
        );
    }

    fn remove_entry(&mut self, entry_id: EntryId) -> Option<DeadLetterEntry> {
        let entry = self.entries.remove(&entry_id)?;
        self.entry_by_job.remove(&entry.job_id);
        Some(entry)
    }

    /// The queued job `job_id`, provided `token` still owns its lease.
    fn leased_mut(&mut self, job_id: JobId, token: Uuid) -> Result<&mut QueuedJob, StoreError> {
        let queued = self.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if queued.lease.as_ref().is_some_and(|l| l.token == token) {
            Ok(queued)
        } else {
            Err(StoreError::LeaseLost(job_id))
        }
    }
}

/// In-memory queue + dead-letter store.
///
/// A single lock guards both the primary queue and the dead-letter partitions,
/// which is what makes the cross-partition moves atomic.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    state: RwLock<StoreState>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>, StoreError> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>, StoreError> {
        self.state.write().map_err(|_| StoreError::Poisoned)
    }
}

impl QueueStore for InMemoryQueueStore {
    fn enqueue(&self, job: JobDescriptor, now: DateTime<Utc>) -> Result<JobId, StoreError> {
        let mut state = self.write()?;
        if state.contains_job(job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        let ready_at = job.ready_at(now);
        state.push_job(job, ready_at);
        Ok(id)
    }

    fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let mut state = self.write()?;

        let next = state
            .jobs
            .values()
            .filter(|q| q.job.queue == queue && q.lease.is_none() && q.ready_at <= now)
            .min_by_key(|q| (Reverse(q.job.priority), q.ready_at, q.seq))
            .map(|q| q.job.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let queued = state.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let lease = Lease::new(worker_id, now, lease_for);
        queued.job.attempts_made += 1;
        queued.lease = Some(lease.clone());

        Ok(Some(ClaimedJob {
            job: queued.job.clone(),
            lease,
        }))
    }

    fn extend_lease(
        &self,
        job_id: JobId,
        token: Uuid,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, StoreError> {
        let mut state = self.write()?;
        let queued = state.leased_mut(job_id, token)?;
        let lease = queued.lease.as_mut().ok_or(StoreError::LeaseLost(job_id))?;
        lease.expires_at = add_millis(now, lease_for.as_millis().min(u64::MAX as u128) as u64);
        Ok(lease.clone())
    }

    fn complete(&self, job_id: JobId, token: Uuid) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.leased_mut(job_id, token)?;
        state.jobs.remove(&job_id);
        Ok(())
    }

    fn move_to_dead_letter(&self, job_id: JobId, token: Uuid, entry: DeadLetterEntry) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.leased_mut(job_id, token)?;
        state.jobs.remove(&job_id);
        state.entry_by_job.insert(job_id, entry.id);
        state.entries.insert(entry.id, entry);
        Ok(())
    }

    fn claim_expired_lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiredClaim>, StoreError> {
        let mut state = self.write()?;

        let expired = state
            .jobs
            .values()
            .filter(|q| q.job.queue == queue)
            .filter_map(|q| q.lease.as_ref().filter(|l| l.is_expired(now)).map(|l| (l.expires_at, q.job.id)))
            .min();

        let Some((_, job_id)) = expired else {
            return Ok(None);
        };
        let queued = state.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let lease = Lease::new(worker_id, now, lease_for);
        let previous = queued.lease.replace(lease.clone()).ok_or(StoreError::LeaseLost(job_id))?;

        Ok(Some(ExpiredClaim {
            claimed: ClaimedJob {
                job: queued.job.clone(),
                lease,
            },
            expired: previous,
        }))
    }

    fn promote_due_scheduled(&self, now: DateTime<Utc>) -> Result<Option<JobDescriptor>, StoreError> {
        let mut state = self.write()?;

        let due = state
            .entries
            .values()
            .filter(|e| e.is_due(now))
            .min_by_key(|e| (e.ready_at, e.failed_at))
            .map(|e| e.id);

        let Some(entry_id) = due else {
            return Ok(None);
        };
        let entry = state.remove_entry(entry_id).ok_or(StoreError::EntryNotFound(entry_id))?;
        let job = entry.requeued_job();
        state.push_job(job.clone(), now);
        Ok(Some(job))
    }

    fn requeue_quarantined(&self, entry_id: EntryId, now: DateTime<Utc>) -> Result<JobDescriptor, StoreError> {
        let mut state = self.write()?;

        match state.entries.get(&entry_id) {
            None => return Err(StoreError::EntryNotFound(entry_id)),
            Some(entry) if entry.status != EntryStatus::Quarantined => {
                return Err(StoreError::NotQuarantined(entry_id));
            }
            Some(_) => {}
        }

        let entry = state.remove_entry(entry_id).ok_or(StoreError::EntryNotFound(entry_id))?;
        let job = entry.manually_retried_job();
        state.push_job(job.clone(), now);
        Ok(job)
    }

    fn get_entry(&self, entry_id: EntryId) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(self.read()?.entries.get(&entry_id).cloned())
    }

    fn list_entries(&self, queue: Option<&str>) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let state = self.read()?;
        Ok(state
            .entries
            .values()
            .filter(|e| queue.is_none_or(|q| e.original_queue == q))
            .cloned()
            .collect())
    }

    fn purge_quarantined_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut state = self.write()?;

        let doomed: Vec<EntryId> = state
            .entries
            .values()
            .filter(|e| e.is_quarantined() && e.failed_at < cutoff)
            .map(|e| e.id)
            .collect();

        Ok(doomed
            .into_iter()
            .filter_map(|id| state.remove_entry(id))
            .collect())
    }

    fn count_quarantined(&self, queue: &str) -> Result<usize, StoreError> {
        let state = self.read()?;
        Ok(state
            .entries
            .values()
            .filter(|e| e.is_quarantined() && e.original_queue == queue)
            .count())
    }

    fn locate_job(&self, job_id: JobId) -> Result<Vec<JobLocation>, StoreError> {
        let state = self.read()?;
        let mut found = Vec::new();

        if let Some(queued) = state.jobs.get(&job_id) {
            found.push(match queued.lease {
                Some(_) => JobLocation::Running,
                None => JobLocation::Waiting,
            });
        }
        for entry in state.entries.values().filter(|e| e.job_id == job_id) {
            found.push(match entry.status {
                EntryStatus::Scheduled => JobLocation::Scheduled(entry.id),
                EntryStatus::Quarantined => JobLocation::Quarantined(entry.id),
            });
        }

        Ok(found)
    }

    fn queue_depth(&self, queue: &str) -> Result<QueueDepth, StoreError> {
        let state = self.read()?;
        let mut depth = QueueDepth::default();
        for queued in state.jobs.values().filter(|q| q.job.queue == queue) {
            match queued.lease {
                Some(_) => depth.running += 1,
                None => depth.waiting += 1,
            }
        }
        Ok(depth)
    }
}
