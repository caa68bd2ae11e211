//! Job descriptors, submission options and leases.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobward_core::{EntryId, JobId};

/// Longest delay we represent (100 years); anything above is clamped.
const MAX_DELAY_MS: u64 = 3_153_600_000_000;

/// `at + ms`, clamped instead of overflowing.
pub(crate) fn add_millis(at: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    let ms = ms.min(MAX_DELAY_MS) as i64;
    at.checked_add_signed(chrono::Duration::milliseconds(ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whole milliseconds between two instants, zero if `to` is before `from`.
pub(crate) fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

/// Options accepted by `submit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Higher runs first.
    pub priority: i32,
    /// Delay before the job becomes visible to workers.
    pub delay: Duration,
    /// Named retry strategy; overrides the queue's strategy.
    pub retry_strategy: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_retry_strategy(mut self, name: impl Into<String>) -> Self {
        self.retry_strategy = Some(name.into());
        self
    }
}

/// Bookkeeping carried with a job across retries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Strategy name chosen at submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<String>,
    /// Set once the job has come back from the dead-letter store.
    #[serde(default)]
    pub requeued: bool,
    /// Attempt count before a manual retry reset it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_attempts: Option<u32>,
    /// Dead-letter entry the job was last requeued from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_entry: Option<EntryId>,
}

/// A unit of work in the primary queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    /// Opaque to the queue; interpreted by the handler.
    pub payload: serde_json::Value,
    pub priority: i32,
    pub delay_ms: u64,
    pub created_at: DateTime<Utc>,
    /// Executions started so far (incremented on claim).
    pub attempts_made: u32,
    #[serde(default)]
    pub metadata: JobMetadata,
}

impl JobDescriptor {
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            priority: options.priority,
            delay_ms: options.delay.as_millis().min(u64::MAX as u128) as u64,
            created_at: Utc::now(),
            attempts_made: 0,
            metadata: JobMetadata {
                retry_strategy: options.retry_strategy.clone(),
                ..JobMetadata::default()
            },
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// When the job becomes visible if enqueued at `enqueued_at`.
    pub fn ready_at(&self, enqueued_at: DateTime<Utc>) -> DateTime<Utc> {
        add_millis(enqueued_at, self.delay_ms)
    }
}

/// Temporary ownership of a claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Proof of ownership; every state change on a leased job must present it.
    pub token: Uuid,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(worker_id: impl Into<String>, now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            token: Uuid::new_v4(),
            worker_id: worker_id.into(),
            claimed_at: now,
            expires_at: add_millis(now, duration.as_millis().min(u64::MAX as u128) as u64),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A job together with the lease its worker holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: JobDescriptor,
    pub lease: Lease,
}

/// Where a job currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "location", content = "entry_id")]
pub enum JobLocation {
    /// In the primary queue, waiting for a worker (possibly delayed).
    Waiting,
    /// In the primary queue, leased by a worker.
    Running,
    Scheduled(EntryId),
    Quarantined(EntryId),
}
