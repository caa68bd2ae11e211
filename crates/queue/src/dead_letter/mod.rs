//! Dead-letter store decisions: retry later or quarantine.
//!
//! Every failed execution ends up here. The resolved [`RetryStrategy`] decides
//! between a Scheduled entry (automatic retry once its backoff elapses) and a
//! Quarantined entry (operator attention). The move out of the primary queue
//! is a single store operation either way.
//!
//! [`RetryStrategy`]: crate::strategy::RetryStrategy

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use jobward_core::{EntryId, JobError};

use crate::backoff::calculate_backoff;
use crate::job::{ClaimedJob, add_millis};
use crate::monitor::AlertMonitor;
use crate::store::{QueueStore, StoreError};
use crate::strategy::RetryStrategyRegistry;

mod entry;
pub mod worker;

pub use entry::{
    DeadLetterEntry, EntryMetadata, EntryStatus, FailureContext, PRIORITY_BUSINESS, PRIORITY_NORMAL, PRIORITY_URGENT,
    quarantine_priority,
};

/// Why a failure was quarantined instead of retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    /// The strategy rejects this error outright.
    NonRetryable,
    RetriesExhausted,
    /// The retry strategy could not be resolved.
    ClassificationFailed,
    /// Writing the Scheduled entry failed.
    SchedulingFailed,
}

/// What happened to a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Scheduled {
        entry_id: EntryId,
        strategy: String,
        attempts: u32,
        delay: Duration,
        ready_at: DateTime<Utc>,
    },
    Quarantined {
        entry_id: EntryId,
        strategy: Option<String>,
        attempts: u32,
        priority: u8,
        reason: QuarantineReason,
    },
}

impl FailureOutcome {
    pub fn entry_id(&self) -> EntryId {
        match self {
            FailureOutcome::Scheduled { entry_id, .. } | FailureOutcome::Quarantined { entry_id, .. } => *entry_id,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        matches!(self, FailureOutcome::Quarantined { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead-letter store error: {0}")]
    Store(#[from] StoreError),
}

/// Routes failed executions into the dead-letter store.
pub struct DeadLetterQueue<S> {
    store: S,
    strategies: Arc<RetryStrategyRegistry>,
    monitor: Arc<AlertMonitor>,
}

impl<S: std::fmt::Debug> std::fmt::Debug for DeadLetterQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("store", &self.store)
            .field("strategies", &self.strategies)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl<S: QueueStore> DeadLetterQueue<S> {
    pub fn new(store: S, strategies: Arc<RetryStrategyRegistry>, monitor: Arc<AlertMonitor>) -> Self {
        Self {
            store,
            strategies,
            monitor,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn strategies(&self) -> &Arc<RetryStrategyRegistry> {
        &self.strategies
    }

    pub fn monitor(&self) -> &Arc<AlertMonitor> {
        &self.monitor
    }

    /// Classify a failed execution and move the job out of the primary queue.
    ///
    /// On error the job is left leased in the primary queue, where lease
    /// expiry will pick it up again.
    pub fn handle_failure(
        &self,
        claimed: &ClaimedJob,
        error: JobError,
        ctx: &FailureContext,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, DeadLetterError> {
        let job = &claimed.job;
        let attempts = job.attempts_made;

        let resolved = match self.strategies.resolve(job, &error) {
            Ok(resolved) => resolved,
            Err(classification) => {
                error!(
                    job_id = %job.id,
                    queue = %job.queue,
                    error = %classification,
                    "failed to classify job failure"
                );
                let error = JobError {
                    message: format!("{classification}; original error: {}", error.message),
                    ..error
                };
                return self.quarantine(claimed, error, ctx, None, QuarantineReason::ClassificationFailed, now);
            }
        };

        if !resolved.strategy.should_retry(attempts, &error) {
            let reason = if attempts >= resolved.strategy.max_retries {
                QuarantineReason::RetriesExhausted
            } else {
                QuarantineReason::NonRetryable
            };
            return self.quarantine(claimed, error, ctx, Some(&resolved.name), reason, now);
        }

        let delay = calculate_backoff(attempts, &resolved.strategy);
        let ready_at = add_millis(now, delay.as_millis().min(u64::MAX as u128) as u64);
        let entry = DeadLetterEntry::scheduled(claimed, error.clone(), ctx, &resolved.name, now, ready_at);
        let entry_id = entry.id;

        match self.store.move_to_dead_letter(job.id, claimed.lease.token, entry) {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    queue = %job.queue,
                    entry_id = %entry_id,
                    strategy = %resolved.name,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "job failed, retry scheduled"
                );
                Ok(FailureOutcome::Scheduled {
                    entry_id,
                    strategy: resolved.name,
                    attempts,
                    delay,
                    ready_at,
                })
            }
            Err(e @ (StoreError::LeaseLost(_) | StoreError::NotFound(_))) => Err(e.into()),
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    queue = %job.queue,
                    error = %e,
                    "failed to schedule retry, quarantining instead"
                );
                self.quarantine(claimed, error, ctx, Some(&resolved.name), QuarantineReason::SchedulingFailed, now)
            }
        }
    }

    fn quarantine(
        &self,
        claimed: &ClaimedJob,
        error: JobError,
        ctx: &FailureContext,
        strategy: Option<&str>,
        reason: QuarantineReason,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, DeadLetterError> {
        let job = &claimed.job;
        let entry = DeadLetterEntry::quarantined(claimed, error, ctx, strategy, now);
        let entry_id = entry.id;
        let priority = entry.priority;
        let error = entry.error.to_string();

        self.store.move_to_dead_letter(job.id, claimed.lease.token, entry)?;
        warn!(
            job_id = %job.id,
            queue = %job.queue,
            entry_id = %entry_id,
            attempts = job.attempts_made,
            priority,
            reason = ?reason,
            error = %error,
            "job quarantined"
        );
        self.observe_queue(&job.queue);

        Ok(FailureOutcome::Quarantined {
            entry_id,
            strategy: strategy.map(str::to_string),
            attempts: job.attempts_made,
            priority,
            reason,
        })
    }

    /// Recount quarantined entries of `queue` and feed the alert monitor.
    pub fn observe_queue(&self, queue: &str) {
        if let Err(e) = self.monitor.observe_with(queue, || self.store.count_quarantined(queue)) {
            warn!(queue = %queue, error = %e, "failed to count quarantined entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobDescriptor, JobLocation, JobOptions};
    use crate::monitor::{InMemoryAlertSink, MonitorConfig};
    use crate::store::InMemoryQueueStore;
    use crate::strategy::RetryStrategy;

    struct Fixture {
        store: Arc<InMemoryQueueStore>,
        dlq: DeadLetterQueue<Arc<InMemoryQueueStore>>,
        alerts: Arc<InMemoryAlertSink>,
    }

    fn fixture(threshold: usize) -> Fixture {
        let store = InMemoryQueueStore::arc();
        let alerts = Arc::new(InMemoryAlertSink::new());
        let monitor = Arc::new(AlertMonitor::new(
            alerts.clone(),
            MonitorConfig {
                default_threshold: threshold,
                ..MonitorConfig::default()
            },
        ));
        let dlq = DeadLetterQueue::new(store.clone(), Arc::new(RetryStrategyRegistry::new()), monitor);
        Fixture { store, dlq, alerts }
    }

    fn claim(store: &InMemoryQueueStore, opts: JobOptions, now: DateTime<Utc>) -> ClaimedJob {
        let job = JobDescriptor::new("import", "manufacturing.import", serde_json::json!({}), &opts);
        store.enqueue(job, now).unwrap();
        store
            .claim_next("import", "w-1", Duration::from_secs(60), now)
            .unwrap()
            .unwrap()
    }

    fn ctx() -> FailureContext {
        FailureContext {
            worker_id: "w-1".to_string(),
            processing_time: Duration::from_millis(5),
        }
    }

    #[test]
    fn transient_failure_is_scheduled_with_backoff() {
        let f = fixture(10);
        let now = Utc::now();
        let claimed = claim(&f.store, JobOptions::new(), now);

        let outcome = f
            .dlq
            .handle_failure(&claimed, JobError::untyped("connect ECONNREFUSED 10.0.0.1:5432"), &ctx(), now)
            .unwrap();

        let FailureOutcome::Scheduled { entry_id, strategy, delay, ready_at, .. } = outcome else {
            panic!("expected scheduled outcome, got {outcome:?}");
        };
        assert_eq!(strategy, "network");
        assert!((900..=1100).contains(&(delay.as_millis() as u64)));
        assert_eq!(f.store.locate_job(claimed.job.id).unwrap(), vec![JobLocation::Scheduled(entry_id)]);
        let entry = f.store.get_entry(entry_id).unwrap().unwrap();
        assert_eq!(entry.ready_at, Some(ready_at));
    }

    #[test]
    fn validation_failure_is_quarantined_immediately() {
        let f = fixture(10);
        let now = Utc::now();
        let claimed = claim(&f.store, JobOptions::new(), now);

        let outcome = f
            .dlq
            .handle_failure(&claimed, JobError::validation("row 3: missing machine_id"), &ctx(), now)
            .unwrap();

        let FailureOutcome::Quarantined { entry_id, priority, reason, attempts, .. } = outcome else {
            panic!("expected quarantine, got {outcome:?}");
        };
        assert_eq!(priority, PRIORITY_BUSINESS);
        assert_eq!(reason, QuarantineReason::NonRetryable);
        assert_eq!(attempts, 1);
        assert_eq!(f.store.locate_job(claimed.job.id).unwrap(), vec![JobLocation::Quarantined(entry_id)]);
    }

    #[test]
    fn named_validation_error_is_not_mistaken_for_a_transient_one() {
        let f = fixture(10);
        let now = Utc::now();

        for message in ["ValidationError: timeout must be positive", "ValidationError: database column missing"] {
            let claimed = claim(&f.store, JobOptions::new(), now);
            let outcome = f.dlq.handle_failure(&claimed, JobError::untyped(message), &ctx(), now).unwrap();
            let FailureOutcome::Quarantined { strategy, priority, reason, .. } = outcome else {
                panic!("expected quarantine for {message:?}, got {outcome:?}");
            };
            assert_eq!(strategy.as_deref(), Some("default"), "{message}");
            assert_eq!(priority, PRIORITY_BUSINESS, "{message}");
            assert_eq!(reason, QuarantineReason::NonRetryable, "{message}");
        }
    }

    #[test]
    fn typed_validation_error_with_custom_code_is_quarantined() {
        let f = fixture(10);
        let now = Utc::now();
        let claimed = claim(&f.store, JobOptions::new(), now);

        let error = JobError::validation("row 3 bad").with_code("E_BAD_ROW");
        let outcome = f.dlq.handle_failure(&claimed, error, &ctx(), now).unwrap();
        assert!(matches!(
            outcome,
            FailureOutcome::Quarantined { reason: QuarantineReason::NonRetryable, priority: PRIORITY_BUSINESS, .. }
        ));
        let entry = f.store.get_entry(outcome.entry_id()).unwrap().unwrap();
        assert_eq!(entry.error.code(), Some("E_BAD_ROW"));
    }

    #[test]
    fn exhausted_budget_is_quarantined() {
        let f = fixture(10);
        f.dlq.strategies().register("once", RetryStrategy::no_retry()).unwrap();
        let now = Utc::now();
        let claimed = claim(&f.store, JobOptions::new().with_retry_strategy("once"), now);

        let outcome = f.dlq.handle_failure(&claimed, JobError::untyped("boom"), &ctx(), now).unwrap();
        assert!(matches!(
            outcome,
            FailureOutcome::Quarantined { reason: QuarantineReason::RetriesExhausted, .. }
        ));
    }

    #[test]
    fn unknown_strategy_still_quarantines_with_both_errors() {
        let f = fixture(10);
        let now = Utc::now();
        let claimed = claim(&f.store, JobOptions::new().with_retry_strategy("missing"), now);

        let outcome = f.dlq.handle_failure(&claimed, JobError::untyped("disk on fire"), &ctx(), now).unwrap();
        let FailureOutcome::Quarantined { entry_id, reason, strategy, .. } = outcome else {
            panic!("expected quarantine, got {outcome:?}");
        };
        assert_eq!(reason, QuarantineReason::ClassificationFailed);
        assert_eq!(strategy, None);

        let entry = f.store.get_entry(entry_id).unwrap().unwrap();
        assert!(entry.error.message.contains("unknown retry strategy: missing"));
        assert!(entry.error.message.contains("disk on fire"));
    }

    #[test]
    fn stale_lease_is_rejected() {
        let f = fixture(10);
        let now = Utc::now();
        let mut claimed = claim(&f.store, JobOptions::new(), now);
        claimed.lease.token = uuid::Uuid::new_v4();

        let err = f
            .dlq
            .handle_failure(&claimed, JobError::validation("bad"), &ctx(), now)
            .unwrap_err();
        assert!(matches!(err, DeadLetterError::Store(StoreError::LeaseLost(_))));
        assert_eq!(f.store.locate_job(claimed.job.id).unwrap(), vec![JobLocation::Running]);
    }

    #[test]
    fn quarantine_feeds_the_monitor() {
        let f = fixture(2);
        let now = Utc::now();
        for _ in 0..3 {
            let claimed = claim(&f.store, JobOptions::new(), now);
            f.dlq.handle_failure(&claimed, JobError::validation("bad"), &ctx(), now).unwrap();
        }
        let alerts = f.alerts.all();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].count, 2);
    }
}
