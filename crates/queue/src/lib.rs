//! Background job system with per-queue retry strategies, backoff and a
//! dead-letter store.
//!
//! ## Design
//!
//! - Jobs live in exactly one place: the primary queue, a Scheduled retry
//!   entry or a Quarantined entry. Every move between them is one atomic store
//!   operation.
//! - Claims carry a lease; idle workers reclaim jobs whose lease expired.
//! - Failures are classified by a retry strategy: retry later with backoff, or
//!   quarantine for an operator.
//! - Quarantine counts feed an edge-triggered alert monitor.
//!
//! ## Components
//!
//! - `QueueStore`: persistence (in-memory, or Redis behind the `redis` feature)
//! - `QueueWorker`: runs handlers for one queue
//! - `DeadLetterQueue`: failure routing, recovery and export
//! - `AlertMonitor`: threshold alerts and periodic health sweeps
//! - `JobService`: façade wiring it all together

pub mod backoff;
pub mod config;
pub mod dead_letter;
pub mod handler;
pub mod job;
pub mod monitor;
pub mod progress;
pub mod recovery;
pub mod service;
pub mod store;
pub mod strategy;
pub mod worker;


pub use backoff::{BackoffType, calculate_backoff};
pub use config::{ConfigError, QueueConfig};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, EntryStatus, FailureOutcome, QuarantineReason};
pub use handler::{HandlerRegistry, JobContext, JobResult};
pub use job::{JobDescriptor, JobLocation, JobOptions};
pub use monitor::{Alert, AlertSink, DeadLetterStats, InMemoryAlertSink, TracingAlertSink};
pub use progress::{ProgressSink, ProgressUpdate, TracingProgressSink};
pub use recovery::{EntryFilter, ExportFormat};
pub use service::{JobService, ServiceError};
pub use store::{InMemoryQueueStore, QueueStore, StoreError};
pub use strategy::{RetryStrategy, RetryStrategyRegistry};
pub use worker::{ProcessOutcome, WorkerPoolHandle};

pub use jobward_core::{EntryId, ErrorKind, JobError, JobId};
