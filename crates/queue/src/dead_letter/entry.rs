//! Dead-letter entry model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobward_core::{EntryId, ErrorKind, JobError, JobId};

use crate::job::{ClaimedJob, JobDescriptor, JobMetadata};

/// Quarantine priority for database and critical failures.
pub const PRIORITY_URGENT: u8 = 1;
/// Quarantine priority for validation and business-rule failures.
pub const PRIORITY_BUSINESS: u8 = 5;
/// Quarantine priority for everything else.
pub const PRIORITY_NORMAL: u8 = 10;

/// Partition of the dead-letter store an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for its backoff to elapse; DLQ workers will requeue it.
    Scheduled,
    /// Needs an operator.
    Quarantined,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Scheduled => "scheduled",
            EntryStatus::Quarantined => "quarantined",
        }
    }
}

/// Execution details of the failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub processing_time_ms: u64,
    pub worker_id: String,
    pub original_delay_ms: u64,
}

/// Who failed and how long it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub worker_id: String,
    pub processing_time: Duration,
}

/// A failed job held in the dead-letter store.
///
/// Keeps a full payload snapshot so the job can be replayed or audited after
/// the primary queue has forgotten it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: EntryId,
    pub status: EntryStatus,
    pub original_queue: String,
    pub job_id: JobId,
    pub job_type: String,
    pub job_data: serde_json::Value,
    pub job_priority: i32,
    pub job_created_at: DateTime<Utc>,
    #[serde(default)]
    pub job_metadata: JobMetadata,
    pub error: JobError,
    /// Executions made when the failure was recorded.
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// When the failing execution started.
    pub last_attempt: DateTime<Utc>,
    /// Earliest requeue time; only set on scheduled entries.
    pub ready_at: Option<DateTime<Utc>>,
    /// Operator urgency, 1 (most urgent) to 10.
    pub priority: u8,
    /// Retry strategy that made the decision.
    pub retry_strategy: Option<String>,
    pub metadata: EntryMetadata,
}

/// Urgency of a quarantined failure.
pub fn quarantine_priority(error: &JobError) -> u8 {
    match error.effective_kind() {
        ErrorKind::Database | ErrorKind::Critical => PRIORITY_URGENT,
        ErrorKind::Validation | ErrorKind::Business => PRIORITY_BUSINESS,
        _ => PRIORITY_NORMAL,
    }
}

impl DeadLetterEntry {
    fn from_failure(claimed: &ClaimedJob, error: JobError, ctx: &FailureContext, now: DateTime<Utc>) -> Self {
        let job = &claimed.job;
        Self {
            id: EntryId::new(),
            status: EntryStatus::Quarantined,
            original_queue: job.queue.clone(),
            job_id: job.id,
            job_type: job.job_type.clone(),
            job_data: job.payload.clone(),
            job_priority: job.priority,
            job_created_at: job.created_at,
            job_metadata: job.metadata.clone(),
            error,
            attempts: job.attempts_made,
            failed_at: now,
            last_attempt: claimed.lease.claimed_at,
            ready_at: None,
            priority: PRIORITY_NORMAL,
            retry_strategy: None,
            metadata: EntryMetadata {
                processing_time_ms: ctx.processing_time.as_millis().min(u64::MAX as u128) as u64,
                worker_id: ctx.worker_id.clone(),
                original_delay_ms: job.delay_ms,
            },
        }
    }

    /// Entry for a failure that will be retried once `ready_at` passes.
    pub fn scheduled(
        claimed: &ClaimedJob,
        error: JobError,
        ctx: &FailureContext,
        strategy: &str,
        now: DateTime<Utc>,
        ready_at: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self::from_failure(claimed, error, ctx, now);
        entry.status = EntryStatus::Scheduled;
        entry.ready_at = Some(ready_at);
        entry.retry_strategy = Some(strategy.to_string());
        entry
    }

    /// Entry for a failure that needs an operator.
    pub fn quarantined(
        claimed: &ClaimedJob,
        error: JobError,
        ctx: &FailureContext,
        strategy: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let priority = quarantine_priority(&error);
        let mut entry = Self::from_failure(claimed, error, ctx, now);
        entry.priority = priority;
        entry.retry_strategy = strategy.map(str::to_string);
        entry
    }

    pub fn is_quarantined(&self) -> bool {
        self.status == EntryStatus::Quarantined
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Scheduled && self.ready_at.is_none_or(|at| at <= now)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.failed_at
    }

    fn rebuild_job(&self, attempts_made: u32, metadata: JobMetadata) -> JobDescriptor {
        JobDescriptor {
            id: self.job_id,
            queue: self.original_queue.clone(),
            job_type: self.job_type.clone(),
            payload: self.job_data.clone(),
            priority: self.job_priority,
            delay_ms: 0,
            created_at: self.job_created_at,
            attempts_made,
            metadata,
        }
    }

    /// The job as re-submitted by a DLQ worker: attempts carry forward.
    pub fn requeued_job(&self) -> JobDescriptor {
        let metadata = JobMetadata {
            requeued: true,
            source_entry: Some(self.id),
            ..self.job_metadata.clone()
        };
        self.rebuild_job(self.attempts, metadata)
    }

    /// The job as re-submitted by an operator: a fresh retry budget, with the
    /// previous attempt count kept for reference.
    pub fn manually_retried_job(&self) -> JobDescriptor {
        let metadata = JobMetadata {
            requeued: true,
            previous_attempts: Some(self.attempts),
            source_entry: Some(self.id),
            ..self.job_metadata.clone()
        };
        self.rebuild_job(0, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, Lease};

    fn claimed(attempts: u32) -> ClaimedJob {
        let mut job = JobDescriptor::new(
            "import",
            "manufacturing.import",
            serde_json::json!({"lot": 42}),
            &JobOptions::new().with_priority(3).with_delay(Duration::from_millis(250)),
        );
        job.attempts_made = attempts;
        ClaimedJob {
            job,
            lease: Lease::new("import-1", Utc::now(), Duration::from_secs(60)),
        }
    }

    fn ctx() -> FailureContext {
        FailureContext {
            worker_id: "import-1".to_string(),
            processing_time: Duration::from_millis(42),
        }
    }

    #[test]
    fn priority_follows_error_class() {
        assert_eq!(quarantine_priority(&JobError::database("deadlock")), PRIORITY_URGENT);
        assert_eq!(quarantine_priority(&JobError::untyped("CRITICAL: disk full")), PRIORITY_URGENT);
        assert_eq!(quarantine_priority(&JobError::untyped("ValidationError: bad input")), PRIORITY_BUSINESS);
        assert_eq!(quarantine_priority(&JobError::business("over credit")), PRIORITY_BUSINESS);
        assert_eq!(quarantine_priority(&JobError::untyped("boom")), PRIORITY_NORMAL);
    }

    #[test]
    fn quarantined_entry_snapshots_the_job() {
        let c = claimed(2);
        let now = Utc::now();
        let entry = DeadLetterEntry::quarantined(&c, JobError::validation("bad"), &ctx(), Some("default"), now);

        assert!(entry.is_quarantined());
        assert_eq!(entry.job_id, c.job.id);
        assert_eq!(entry.job_data, serde_json::json!({"lot": 42}));
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.priority, PRIORITY_BUSINESS);
        assert_eq!(entry.metadata.processing_time_ms, 42);
        assert_eq!(entry.metadata.original_delay_ms, 250);
        assert_eq!(entry.last_attempt, c.lease.claimed_at);
        assert!(entry.ready_at.is_none());
    }

    #[test]
    fn scheduled_entry_becomes_due_at_ready_time() {
        let c = claimed(1);
        let now = Utc::now();
        let ready = now + chrono::Duration::seconds(1);
        let entry = DeadLetterEntry::scheduled(&c, JobError::network("refused"), &ctx(), "network", now, ready);

        assert!(!entry.is_due(now));
        assert!(entry.is_due(ready));
        assert_eq!(entry.retry_strategy.as_deref(), Some("network"));
    }

    #[test]
    fn requeue_carries_attempts_forward() {
        let c = claimed(2);
        let entry = DeadLetterEntry::scheduled(&c, JobError::network("x"), &ctx(), "network", Utc::now(), Utc::now());
        let job = entry.requeued_job();

        assert_eq!(job.id, c.job.id);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.delay_ms, 0);
        assert!(job.metadata.requeued);
        assert_eq!(job.metadata.source_entry, Some(entry.id));
    }

    #[test]
    fn manual_retry_resets_budget() {
        let c = claimed(3);
        let entry = DeadLetterEntry::quarantined(&c, JobError::untyped("boom"), &ctx(), None, Utc::now());
        let job = entry.manually_retried_job();

        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.metadata.previous_attempts, Some(3));
        assert!(job.metadata.requeued);
    }
}
