//! Job handlers and the context they run in.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use jobward_core::JobError;

use crate::job::JobDescriptor;
use crate::progress::{ProgressSink, ProgressUpdate};
use crate::store::StoreError;

/// What a handler returns: a result value on success, a typed error otherwise.
pub type JobResult = Result<serde_json::Value, JobError>;

/// Job handler function type.
pub type JobHandler = Arc<dyn Fn(&JobContext<'_>) -> JobResult + Send + Sync>;

/// Renews the lease of the running job.
pub type Heartbeat<'a> = &'a (dyn Fn() -> Result<(), StoreError> + Sync);

/// Everything a handler can see or touch while it runs.
pub struct JobContext<'a> {
    job: &'a JobDescriptor,
    worker_id: &'a str,
    progress: &'a dyn ProgressSink,
    heartbeat: Heartbeat<'a>,
}

impl<'a> JobContext<'a> {
    pub fn new(
        job: &'a JobDescriptor,
        worker_id: &'a str,
        progress: &'a dyn ProgressSink,
        heartbeat: Heartbeat<'a>,
    ) -> Self {
        Self {
            job,
            worker_id,
            progress,
            heartbeat,
        }
    }

    pub fn job(&self) -> &JobDescriptor {
        self.job
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// 1 on the first execution.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made
    }

    pub fn worker_id(&self) -> &str {
        self.worker_id
    }

    /// Report coarse progress.
    pub fn report_progress(&self, percent: u8, message: impl Into<String>) {
        self.report(Some(percent.min(100)), None, None, Some(message.into()));
    }

    /// Report item counts; percent is derived when `total` is non-zero.
    pub fn report_items(&self, processed: u64, total: u64) {
        let percent = (total > 0).then(|| ((processed.min(total) * 100) / total) as u8);
        self.report(percent, Some(processed), Some(total), None);
    }

    fn report(&self, percent: Option<u8>, processed: Option<u64>, total: Option<u64>, message: Option<String>) {
        self.progress.report(ProgressUpdate {
            job_id: self.job.id,
            queue: self.job.queue.clone(),
            job_type: self.job.job_type.clone(),
            percent,
            processed,
            total,
            message,
            at: Utc::now(),
        });
    }

    /// Extend the lease; long-running handlers should call this periodically.
    pub fn heartbeat(&self) -> Result<(), StoreError> {
        (self.heartbeat)()
    }
}

/// Maps job types to handlers.
///
/// Lookup order: exact type, then the longest matching category pattern
/// (`"import.*"` matches `"import.csv"`), then the wildcard `"*"`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let patterns: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("HandlerRegistry").field("patterns", &patterns).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type or pattern. Replaces any previous one.
    pub fn register<F>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JobContext<'_>) -> JobResult + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        tracing::debug!(pattern = %pattern, "registered job handler");
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(pattern, Arc::new(handler));
        }
    }

    /// Get the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<JobHandler> {
        let handlers = self.handlers.read().ok()?;

        // Try exact match first
        if let Some(h) = handlers.get(job_type) {
            return Some(h.clone());
        }

        // Try category match (e.g., "import.*" matches "import.csv")
        let category = handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h.clone());
        if category.is_some() {
            return category;
        }

        // Try wildcard
        handlers.get("*").cloned()
    }
}
