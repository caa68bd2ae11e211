//! Retry strategies and the registry that picks one for a failing job.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use jobward_core::{ErrorKind, JobError};

use crate::backoff::BackoffType;
use crate::job::JobDescriptor;

/// Name of the fallback strategy.
pub const DEFAULT_STRATEGY: &str = "default";

/// Name of the strategy used for transient infrastructure failures.
pub const NETWORK_STRATEGY: &str = "network";

/// Error codes that never succeed on repetition.
///
/// `BusinessError` is not in the list, so the default policy retries business
/// failures within its budget. [`RetryStrategy::without_business_retries`]
/// quarantines them on the first failure.
pub const PERMANENT_ERROR_CODES: &[&str] = &[
    "ValidationError",
    "AuthenticationError",
    "AuthorizationError",
    "NotFoundError",
];

/// Retry policy for a class of jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Executions allowed before the job is quarantined.
    pub max_retries: u32,
    pub backoff_type: BackoffType,
    pub backoff_delay_ms: u64,
    #[serde(default)]
    pub max_backoff_delay_ms: Option<u64>,
    /// Allow-list: when non-empty, only these codes are retried.
    #[serde(default)]
    pub retryable_error_codes: Option<BTreeSet<String>>,
    /// Deny-list: these codes are never retried.
    #[serde(default)]
    pub non_retryable_error_codes: Option<BTreeSet<String>>,
}

impl Default for RetryStrategy {
    /// Three attempts, exponential from 5s, capped at 5 minutes. Denies
    /// [`PERMANENT_ERROR_CODES`]; business errors are retried.
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_type: BackoffType::Exponential,
            backoff_delay_ms: 5_000,
            max_backoff_delay_ms: Some(300_000),
            retryable_error_codes: None,
            non_retryable_error_codes: Some(permanent_codes()),
        }
    }
}

fn permanent_codes() -> BTreeSet<String> {
    PERMANENT_ERROR_CODES.iter().map(|c| c.to_string()).collect()
}

impl RetryStrategy {
    /// Policy for connection failures and timeouts: more attempts, shorter delays.
    pub fn network() -> Self {
        Self {
            max_retries: 5,
            backoff_type: BackoffType::Exponential,
            backoff_delay_ms: 1_000,
            max_backoff_delay_ms: Some(60_000),
            retryable_error_codes: None,
            non_retryable_error_codes: Some(permanent_codes()),
        }
    }

    /// A single attempt; every failure is quarantined.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    /// The default policy with business-rule failures quarantined on first sight.
    pub fn without_business_retries() -> Self {
        Self::default().with_non_retryable_codes([ErrorKind::Business.code().unwrap_or("BusinessError")])
    }

    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_type: BackoffType::Fixed,
            backoff_delay_ms: delay_ms,
            max_backoff_delay_ms: None,
            ..Self::default()
        }
    }

    pub fn linear(max_retries: u32, delay_ms: u64, cap_ms: Option<u64>) -> Self {
        Self {
            max_retries,
            backoff_type: BackoffType::Linear,
            backoff_delay_ms: delay_ms,
            max_backoff_delay_ms: cap_ms,
            ..Self::default()
        }
    }

    pub fn exponential(max_retries: u32, delay_ms: u64, cap_ms: Option<u64>) -> Self {
        Self {
            max_retries,
            backoff_type: BackoffType::Exponential,
            backoff_delay_ms: delay_ms,
            max_backoff_delay_ms: cap_ms,
            ..Self::default()
        }
    }

    /// Restrict retries to errors carrying one of `codes`.
    pub fn with_retryable_codes<I, C>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.retryable_error_codes = Some(codes.into_iter().map(Into::into).collect());
        self
    }

    /// Never retry errors carrying one of `codes` (added to the existing deny-list).
    pub fn with_non_retryable_codes<I, C>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.non_retryable_error_codes
            .get_or_insert_with(BTreeSet::new)
            .extend(codes.into_iter().map(Into::into));
        self
    }

    /// Decide whether a job that has run `attempts` times should run again after `error`.
    ///
    /// Deny-list wins over allow-list. With an empty allow-list everything not
    /// denied is retried.
    pub fn should_retry(&self, attempts: u32, error: &JobError) -> bool {
        if attempts >= self.max_retries {
            return false;
        }

        let denied = self
            .non_retryable_error_codes
            .iter()
            .flatten()
            .any(|code| error.matches_code(code));
        if denied {
            return false;
        }

        match &self.retryable_error_codes {
            Some(allowed) if !allowed.is_empty() => {
                allowed.iter().any(|code| error.matches_code(code))
            }
            _ => true,
        }
    }
}

/// Why a particular strategy was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySource {
    /// Named on the job at submission.
    Job,
    /// Bound to the job's queue.
    Queue,
    /// The error looked transient.
    TransientError,
    Default,
}

/// Outcome of strategy resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStrategy {
    pub name: String,
    pub strategy: RetryStrategy,
    pub source: StrategySource,
}

/// Registry lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown retry strategy: {0}")]
    UnknownStrategy(String),
    #[error("retry strategy registry lock poisoned")]
    Poisoned,
}

/// Named retry strategies plus queue bindings.
///
/// Holds configuration only; safe to share between worker threads.
#[derive(Debug)]
pub struct RetryStrategyRegistry {
    strategies: RwLock<HashMap<String, RetryStrategy>>,
    queues: RwLock<HashMap<String, String>>,
}

impl Default for RetryStrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryStrategyRegistry {
    /// A registry with the `default` and `network` strategies installed.
    pub fn new() -> Self {
        let mut strategies = HashMap::new();
        strategies.insert(DEFAULT_STRATEGY.to_string(), RetryStrategy::default());
        strategies.insert(NETWORK_STRATEGY.to_string(), RetryStrategy::network());
        Self {
            strategies: RwLock::new(strategies),
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a named strategy. Registering `default` replaces the fallback.
    pub fn register(&self, name: impl Into<String>, strategy: RetryStrategy) -> Result<(), RegistryError> {
        let name = name.into();
        tracing::debug!(strategy = %name, max_retries = strategy.max_retries, "registered retry strategy");
        self.strategies
            .write()
            .map_err(|_| RegistryError::Poisoned)?
            .insert(name, strategy);
        Ok(())
    }

    /// Use the strategy `name` for every job on `queue` that does not name its own.
    pub fn register_for_queue(&self, queue: impl Into<String>, name: impl Into<String>) -> Result<(), RegistryError> {
        let name = name.into();
        if !self.contains(&name)? {
            return Err(RegistryError::UnknownStrategy(name));
        }
        self.queues
            .write()
            .map_err(|_| RegistryError::Poisoned)?
            .insert(queue.into(), name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<RetryStrategy>, RegistryError> {
        Ok(self
            .strategies
            .read()
            .map_err(|_| RegistryError::Poisoned)?
            .get(name)
            .cloned())
    }

    fn contains(&self, name: &str) -> Result<bool, RegistryError> {
        Ok(self
            .strategies
            .read()
            .map_err(|_| RegistryError::Poisoned)?
            .contains_key(name))
    }

    fn named(&self, name: &str, source: StrategySource) -> Result<ResolvedStrategy, RegistryError> {
        let strategy = self
            .get(name)?
            .ok_or_else(|| RegistryError::UnknownStrategy(name.to_string()))?;
        Ok(ResolvedStrategy {
            name: name.to_string(),
            strategy,
            source,
        })
    }

    /// Pick the strategy for `job` after it failed with `error`.
    ///
    /// Order: strategy named on the job, strategy bound to the queue, the
    /// network strategy for transient errors, the default.
    pub fn resolve(&self, job: &JobDescriptor, error: &JobError) -> Result<ResolvedStrategy, RegistryError> {
        if let Some(name) = &job.metadata.retry_strategy {
            return self.named(name, StrategySource::Job);
        }

        let bound = self
            .queues
            .read()
            .map_err(|_| RegistryError::Poisoned)?
            .get(&job.queue)
            .cloned();
        if let Some(name) = bound {
            return self.named(&name, StrategySource::Queue);
        }

        if error.effective_kind() == ErrorKind::Network {
            return self.named(NETWORK_STRATEGY, StrategySource::TransientError);
        }

        self.named(DEFAULT_STRATEGY, StrategySource::Default)
    }
}
