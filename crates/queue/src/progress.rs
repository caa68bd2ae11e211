//! Progress reporting from running handlers.
//!
//! Handlers write structured [`ProgressUpdate`]s to a [`ProgressSink`]; where
//! they end up (logs, a channel feeding a UI, a test buffer) is the sink's
//! business.

use std::sync::{Mutex, mpsc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use jobward_core::JobId;

/// One progress report from a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub queue: String,
    pub job_type: String,
    /// 0-100.
    pub percent: Option<u8>,
    pub processed: Option<u64>,
    pub total: Option<u64>,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Destination for progress updates.
pub trait ProgressSink: Send + Sync + 'static {
    fn report(&self, update: ProgressUpdate);
}

/// Logs every update at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn report(&self, update: ProgressUpdate) {
        info!(
            job_id = %update.job_id,
            queue = %update.queue,
            job_type = %update.job_type,
            percent = ?update.percent,
            processed = ?update.processed,
            total = ?update.total,
            message = update.message.as_deref().unwrap_or(""),
            "job progress"
        );
    }
}

/// Forwards updates into an `mpsc` channel. A dropped receiver discards updates.
#[derive(Debug)]
pub struct ChannelProgressSink {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ChannelProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self { tx }
    }

    /// A sink plus the receiving end.
    pub fn channel() -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn report(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProgressSink {
    inner: Mutex<Vec<ProgressUpdate>>,
}

impl InMemoryProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<ProgressUpdate> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<ProgressUpdate> {
        self.all().into_iter().filter(|u| u.job_id == job_id).collect()
    }
}

impl ProgressSink for InMemoryProgressSink {
    fn report(&self, update: ProgressUpdate) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.push(update);
        }
    }
}
