//! Operator-facing recovery and export over the dead-letter store.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use jobward_core::{EntryId, JobId};

use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue, EntryStatus};
use crate::monitor::DeadLetterStats;
use crate::store::{QueueStore, StoreError};

/// Page size used when a filter does not set one.
pub const DEFAULT_ENTRY_LIMIT: usize = 50;

const CSV_COLUMNS: &[&str] = &[
    "id",
    "status",
    "queue",
    "job_id",
    "job_type",
    "priority",
    "attempts",
    "error_class",
    "error_message",
    "failed_at",
    "ready_at",
    "retry_strategy",
    "worker_id",
    "processing_time_ms",
    "job_data",
];

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("export failed: {0}")]
    Export(#[from] serde_json::Error),
}

/// Which entries `get_entries` returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryFilter {
    pub queue: Option<String>,
    /// Error class or code, e.g. `ValidationError`.
    pub error_type: Option<String>,
    pub status: Option<EntryStatus>,
    /// Defaults to [`DEFAULT_ENTRY_LIMIT`].
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EntryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.status.is_none_or(|s| entry.status == s)
            && self
                .error_type
                .as_deref()
                .is_none_or(|t| entry.error.error_class() == t || entry.error.matches_code(t))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unsupported export format: {other}")),
        }
    }
}

impl<S: QueueStore> DeadLetterQueue<S> {
    /// Re-submit a quarantined job to its original queue with a fresh retry budget.
    pub fn manual_retry(&self, entry_id: EntryId, now: DateTime<Utc>) -> Result<JobId, RecoveryError> {
        let job = self.store().requeue_quarantined(entry_id, now)?;
        info!(
            entry_id = %entry_id,
            job_id = %job.id,
            queue = %job.queue,
            previous_attempts = ?job.metadata.previous_attempts,
            "quarantined job manually retried"
        );
        self.observe_queue(&job.queue);
        Ok(job.id)
    }

    /// Matching entries, newest failure first.
    pub fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<DeadLetterEntry>, RecoveryError> {
        let mut entries: Vec<DeadLetterEntry> = self
            .store()
            .list_entries(filter.queue.as_deref())?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then_with(|| b.id.cmp(&a.id)));

        Ok(entries
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(DEFAULT_ENTRY_LIMIT))
            .collect())
    }

    /// Delete quarantined entries that failed before `cutoff`.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RecoveryError> {
        let purged = self.store().purge_quarantined_before(cutoff)?;
        if purged.is_empty() {
            return Ok(0);
        }

        let mut queues: Vec<&str> = purged.iter().map(|e| e.original_queue.as_str()).collect();
        queues.sort_unstable();
        queues.dedup();
        for queue in &queues {
            self.observe_queue(queue);
        }

        info!(purged = purged.len(), cutoff = %cutoff, "purged quarantined entries");
        Ok(purged.len())
    }

    /// Delete quarantined entries older than `max_age`.
    pub fn purge_old_entries(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize, RecoveryError> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.purge_before(cutoff)
    }

    /// Every dead-letter entry, oldest failure first.
    pub fn export_data(&self, format: ExportFormat) -> Result<String, RecoveryError> {
        let mut entries = self.store().list_entries(None)?;
        entries.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id.cmp(&b.id)));

        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&entries)?),
            ExportFormat::Csv => entries_to_csv(&entries),
        }
    }

    pub fn get_stats(&self) -> Result<DeadLetterStats, RecoveryError> {
        let entries = self.store().list_entries(None)?;
        Ok(DeadLetterStats::from_entries(&entries))
    }
}

fn entries_to_csv(entries: &[DeadLetterEntry]) -> Result<String, RecoveryError> {
    let mut out = CSV_COLUMNS.join(",");
    out.push('\n');

    for e in entries {
        let row = [
            e.id.to_string(),
            e.status.as_str().to_string(),
            e.original_queue.clone(),
            e.job_id.to_string(),
            e.job_type.clone(),
            e.priority.to_string(),
            e.attempts.to_string(),
            e.error.error_class(),
            e.error.message.clone(),
            e.failed_at.to_rfc3339(),
            e.ready_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            e.retry_strategy.clone().unwrap_or_default(),
            e.metadata.worker_id.clone(),
            e.metadata.processing_time_ms.to_string(),
            serde_json::to_string(&e.job_data)?,
        ];
        let cells: Vec<String> = row.iter().map(|c| csv_escape(c)).collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    Ok(out)
}

fn csv_escape(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dead_letter::FailureContext;
    use crate::job::{ClaimedJob, JobDescriptor, JobLocation, JobOptions};
    use crate::monitor::{AlertMonitor, InMemoryAlertSink, MonitorConfig};
    use crate::store::InMemoryQueueStore;
    use crate::strategy::RetryStrategyRegistry;
    use jobward_core::JobError;

    fn dlq() -> DeadLetterQueue<Arc<InMemoryQueueStore>> {
        let monitor = Arc::new(AlertMonitor::new(Arc::new(InMemoryAlertSink::new()), MonitorConfig::default()));
        DeadLetterQueue::new(InMemoryQueueStore::arc(), Arc::new(RetryStrategyRegistry::new()), monitor)
    }

    fn fail(
        dlq: &DeadLetterQueue<Arc<InMemoryQueueStore>>,
        queue: &str,
        error: JobError,
        at: DateTime<Utc>,
    ) -> ClaimedJob {
        let job = JobDescriptor::new(queue, "t", serde_json::json!({"note": "a, \"b\""}), &JobOptions::new());
        dlq.store().enqueue(job, at).unwrap();
        let claimed = dlq
            .store()
            .claim_next(queue, "w", Duration::from_secs(60), at)
            .unwrap()
            .unwrap();
        let ctx = FailureContext {
            worker_id: "w".to_string(),
            processing_time: Duration::from_millis(3),
        };
        dlq.handle_failure(&claimed, error, &ctx, at).unwrap();
        claimed
    }

    #[test]
    fn manual_retry_requeues_quarantined_entries_only() {
        let dlq = dlq();
        let now = Utc::now();
        let quarantined = fail(&dlq, "import", JobError::validation("bad"), now);
        let scheduled = fail(&dlq, "import", JobError::network("refused"), now);

        let entries = dlq.get_entries(&EntryFilter::new()).unwrap();
        let q_entry = entries.iter().find(|e| e.job_id == quarantined.job.id).unwrap().id;
        let s_entry = entries.iter().find(|e| e.job_id == scheduled.job.id).unwrap().id;

        assert!(matches!(
            dlq.manual_retry(s_entry, now),
            Err(RecoveryError::Store(StoreError::NotQuarantined(_)))
        ));
        assert!(matches!(
            dlq.manual_retry(EntryId::new(), now),
            Err(RecoveryError::Store(StoreError::EntryNotFound(_)))
        ));

        let job_id = dlq.manual_retry(q_entry, now).unwrap();
        assert_eq!(job_id, quarantined.job.id);
        assert_eq!(dlq.store().locate_job(job_id).unwrap(), vec![JobLocation::Waiting]);

        let claimed = dlq
            .store()
            .claim_next("import", "w", Duration::from_secs(60), now)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.job.attempts_made, 1);
        assert_eq!(claimed.job.metadata.previous_attempts, Some(1));
    }

    #[test]
    fn entries_are_filtered_paged_and_newest_first() {
        let dlq = dlq();
        let base = Utc::now();
        for i in 0..5 {
            fail(&dlq, "import", JobError::validation(format!("bad {i}")), base + chrono::Duration::seconds(i));
        }
        fail(&dlq, "billing", JobError::database("deadlock"), base);

        let all = dlq.get_entries(&EntryFilter::new()).unwrap();
        assert_eq!(all.len(), 6);
        assert!(all.windows(2).all(|w| w[0].failed_at >= w[1].failed_at));

        let page = dlq.get_entries(&EntryFilter::new().queue("import").limit(2).offset(1)).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].error.message, "bad 3");
        assert_eq!(page[1].error.message, "bad 2");

        let db = dlq.get_entries(&EntryFilter::new().error_type("DatabaseError")).unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db[0].original_queue, "billing");

        // Database errors are retried under the default strategy.
        let scheduled = dlq.get_entries(&EntryFilter::new().status(EntryStatus::Scheduled)).unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].original_queue, "billing");
    }

    #[test]
    fn default_limit_applies() {
        let dlq = dlq();
        let now = Utc::now();
        for _ in 0..(DEFAULT_ENTRY_LIMIT + 5) {
            fail(&dlq, "import", JobError::validation("bad"), now);
        }
        assert_eq!(dlq.get_entries(&EntryFilter::new()).unwrap().len(), DEFAULT_ENTRY_LIMIT);
    }

    #[test]
    fn purge_is_idempotent_and_spares_scheduled_entries() {
        let dlq = dlq();
        let now = Utc::now();
        let old = now - chrono::Duration::days(40);
        fail(&dlq, "import", JobError::validation("old"), old);
        fail(&dlq, "import", JobError::network("old but scheduled"), old);
        fail(&dlq, "import", JobError::validation("recent"), now);

        let max_age = Duration::from_secs(30 * 24 * 60 * 60);
        assert_eq!(dlq.purge_old_entries(max_age, now).unwrap(), 1);
        assert_eq!(dlq.purge_old_entries(max_age, now).unwrap(), 0);

        let stats = dlq.get_stats().unwrap();
        assert_eq!(stats.quarantined, 1);
        assert_eq!(stats.scheduled, 1);
    }

    #[test]
    fn json_export_round_trips() {
        let dlq = dlq();
        let now = Utc::now();
        fail(&dlq, "import", JobError::validation("bad"), now);
        fail(&dlq, "import", JobError::network("refused"), now);

        let json = dlq.export_data(ExportFormat::Json).unwrap();
        let mut exported: Vec<DeadLetterEntry> = serde_json::from_str(&json).unwrap();
        let mut stored = dlq.store().list_entries(None).unwrap();
        exported.sort_by_key(|e| e.id);
        stored.sort_by_key(|e| e.id);
        assert_eq!(exported, stored);
    }

    #[test]
    fn csv_export_escapes_fields() {
        let dlq = dlq();
        fail(&dlq, "import", JobError::validation("row 1, col \"b\"\nbad"), Utc::now());

        let csv = dlq.export_data(ExportFormat::Csv).unwrap();
        let header = csv.lines().next().unwrap();
        assert_eq!(header, CSV_COLUMNS.join(","));
        assert!(csv.contains("\"row 1, col \"\"b\"\"\nbad\""));
        assert!(csv.contains("\"{\"\"note\"\":\"\"a, \\\"\"b\\\"\"\"\"}\""));
    }

    #[test]
    fn csv_escape_leaves_plain_values_alone() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn export_format_parses() {
        assert_eq!("JSON".parse::<ExportFormat>(), Ok(ExportFormat::Json));
        assert_eq!(" csv ".parse::<ExportFormat>(), Ok(ExportFormat::Csv));
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
