//! Quarantine alerting and periodic dead-letter health sweeps.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, RwLock, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::dead_letter::{DeadLetterEntry, EntryStatus};
use crate::store::{QueueStore, StoreError};

/// Default per-queue quarantine threshold.
pub const DEFAULT_ALERT_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A queue's quarantined count reached its threshold.
    QuarantineThreshold,
    /// The oldest quarantined entry is older than the staleness window.
    StaleEntries,
    /// Total dead-letter backlog exceeds the capacity warning.
    BacklogCapacity,
}

/// Notification handed to an [`AlertSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    /// `None` for store-wide alerts.
    pub queue: Option<String>,
    pub count: usize,
    pub threshold: usize,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Where alerts go.
pub trait AlertSink: Send + Sync + 'static {
    fn notify(&self, alert: &Alert);
}

impl<S> AlertSink for Arc<S>
where
    S: AlertSink + ?Sized,
{
    fn notify(&self, alert: &Alert) {
        (**self).notify(alert)
    }
}

/// Logs alerts; critical ones at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: &Alert) {
        let queue = alert.queue.as_deref().unwrap_or("*");
        match alert.severity {
            AlertSeverity::Critical => error!(
                kind = ?alert.kind,
                queue,
                count = alert.count,
                threshold = alert.threshold,
                "{}",
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                kind = ?alert.kind,
                queue,
                count = alert.count,
                threshold = alert.threshold,
                "{}",
                alert.message
            ),
        }
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    inner: Mutex<Vec<Alert>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Alert> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn of_kind(&self, kind: AlertKind) -> Vec<Alert> {
        self.all().into_iter().filter(|a| a.kind == kind).collect()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn notify(&self, alert: &Alert) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.push(alert.clone());
        }
    }
}

/// Aggregate view of the dead-letter store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: usize,
    /// Entries that need an operator.
    #[serde(alias = "failed")]
    pub quarantined: usize,
    /// Entries waiting for their automatic retry.
    #[serde(alias = "pending")]
    pub scheduled: usize,
    pub by_queue: BTreeMap<String, usize>,
    /// Keyed by error class (code, or message prefix).
    pub by_error: BTreeMap<String, usize>,
    /// Failure time of the oldest quarantined entry.
    pub oldest_entry: Option<DateTime<Utc>>,
}

impl DeadLetterStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DeadLetterEntry>) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total += 1;
            match entry.status {
                EntryStatus::Quarantined => {
                    stats.quarantined += 1;
                    if stats.oldest_entry.is_none_or(|t| entry.failed_at < t) {
                        stats.oldest_entry = Some(entry.failed_at);
                    }
                }
                EntryStatus::Scheduled => stats.scheduled += 1,
            }
            *stats.by_queue.entry(entry.original_queue.clone()).or_default() += 1;
            *stats.by_error.entry(entry.error.error_class()).or_default() += 1;
        }
        stats
    }

    /// Age of the oldest quarantined entry.
    pub fn oldest_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.oldest_entry.map(|t| now - t)
    }
}

/// Monitor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub default_threshold: usize,
    pub interval: Duration,
    pub stale_after: Duration,
    pub capacity_warning: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_threshold: DEFAULT_ALERT_THRESHOLD,
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(7 * 24 * 60 * 60),
            capacity_warning: 100,
        }
    }
}

/// Edge-triggered quarantine threshold alerts plus health checks.
///
/// A queue fires one alert when its quarantined count reaches the threshold
/// and stays silent until an observation below the threshold re-arms it.
pub struct AlertMonitor {
    config: MonitorConfig,
    thresholds: RwLock<HashMap<String, usize>>,
    tripped: Mutex<HashSet<String>>,
    sink: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for AlertMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertMonitor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl AlertMonitor {
    pub fn new(sink: Arc<dyn AlertSink>, config: MonitorConfig) -> Self {
        Self {
            config,
            thresholds: RwLock::new(HashMap::new()),
            tripped: Mutex::new(HashSet::new()),
            sink,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Override the threshold for one queue.
    pub fn set_threshold(&self, queue: impl Into<String>, threshold: usize) {
        if let Ok(mut thresholds) = self.thresholds.write() {
            thresholds.insert(queue.into(), threshold);
        }
    }

    pub fn threshold(&self, queue: &str) -> usize {
        self.thresholds
            .read()
            .ok()
            .and_then(|t| t.get(queue).copied())
            .unwrap_or(self.config.default_threshold)
    }

    /// Record the current quarantined count of `queue`; returns the alert if one fired.
    pub fn observe(&self, queue: &str, count: usize) -> Option<Alert> {
        self.observe_with(queue, || Ok::<_, StoreError>(count)).ok().flatten()
    }

    /// Like [`observe`](Self::observe), but counts under the monitor's lock so
    /// concurrent observers cannot apply stale counts out of order.
    pub fn observe_with<E>(
        &self,
        queue: &str,
        count: impl FnOnce() -> Result<usize, E>,
    ) -> Result<Option<Alert>, E> {
        let threshold = self.threshold(queue);
        let alert = {
            let Ok(mut tripped) = self.tripped.lock() else {
                return Ok(None);
            };
            let count = count()?;
            if threshold == 0 || count < threshold {
                tripped.remove(queue);
                None
            } else if tripped.insert(queue.to_string()) {
                Some(Alert {
                    severity: AlertSeverity::Critical,
                    kind: AlertKind::QuarantineThreshold,
                    queue: Some(queue.to_string()),
                    count,
                    threshold,
                    message: format!("{count} quarantined jobs in queue {queue} (threshold {threshold})"),
                    raised_at: Utc::now(),
                })
            } else {
                None
            }
        };

        if let Some(alert) = &alert {
            self.sink.notify(alert);
        }
        Ok(alert)
    }

    /// Staleness and capacity warnings for `stats`; each is sent to the sink.
    pub fn check_health(&self, stats: &DeadLetterStats, now: DateTime<Utc>) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let stale_secs = self.config.stale_after.as_secs().min(i64::MAX as u64) as i64;
        if let Some(age) = stats.oldest_age(now)
            && age > chrono::Duration::seconds(stale_secs)
        {
            alerts.push(Alert {
                severity: AlertSeverity::Warning,
                kind: AlertKind::StaleEntries,
                queue: None,
                count: stats.quarantined,
                threshold: self.config.capacity_warning,
                message: format!("oldest quarantined entry is {} hours old", age.num_hours()),
                raised_at: now,
            });
        }

        let backlog = stats.total;
        if backlog > self.config.capacity_warning {
            alerts.push(Alert {
                severity: AlertSeverity::Warning,
                kind: AlertKind::BacklogCapacity,
                queue: None,
                count: backlog,
                threshold: self.config.capacity_warning,
                message: format!("dead-letter backlog of {backlog} entries exceeds {}", self.config.capacity_warning),
                raised_at: now,
            });
        }

        for alert in &alerts {
            self.sink.notify(alert);
        }
        alerts
    }

    /// One sweep: compute stats from `store`, log them, run health checks.
    pub fn sweep<S: QueueStore + ?Sized>(&self, store: &S, now: DateTime<Utc>) -> Result<DeadLetterStats, StoreError> {
        let entries = store.list_entries(None)?;
        let stats = DeadLetterStats::from_entries(&entries);
        info!(
            total = stats.total,
            quarantined = stats.quarantined,
            scheduled = stats.scheduled,
            by_queue = ?stats.by_queue,
            by_error = ?stats.by_error,
            oldest_age_secs = stats.oldest_age(now).map(|a| a.num_seconds()),
            "dead-letter stats"
        );
        self.check_health(&stats, now);
        Ok(stats)
    }

    /// Run [`sweep`](Self::sweep) every `config.interval` on a background thread.
    pub fn spawn_sweeper<S>(self: Arc<Self>, store: S) -> io::Result<MonitorHandle>
    where
        S: QueueStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let interval = self.config.interval;

        let join = thread::Builder::new()
            .name("jobward-monitor".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "dead-letter monitor started");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            if let Err(e) = self.sweep(&store, Utc::now()) {
                                error!(error = %e, "dead-letter sweep failed");
                            }
                        }
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("dead-letter monitor stopped");
            })?;

        Ok(MonitorHandle {
            shutdown: shutdown_tx,
            join,
        })
    }
}

/// Handle for the sweeper thread.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the sweeper and wait for it.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.join();
    }
}
