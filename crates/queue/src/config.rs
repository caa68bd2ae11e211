//! Runtime configuration, read from `JOBWARD_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::dead_letter::worker::DeadLetterWorkerConfig;
use crate::monitor::MonitorConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for the whole job system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Threads per primary queue.
    pub worker_concurrency: usize,
    pub dlq_concurrency: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub alert_threshold: usize,
    pub monitor_interval: Duration,
    pub stale_after: Duration,
    pub capacity_warning: usize,
    /// Primary queues the worker binary consumes.
    pub queues: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            dlq_concurrency: 5,
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_millis(300_000),
            alert_threshold: 10,
            monitor_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(604_800),
            capacity_warning: 100,
            queues: vec!["import".to_string()],
        }
    }
}

impl QueueConfig {
    /// Read the process environment; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty()).map(|v| (key, v));

        if let Some((key, v)) = get("JOBWARD_WORKER_CONCURRENCY") {
            cfg.worker_concurrency = positive(key, &v)?;
        }
        if let Some((key, v)) = get("JOBWARD_DLQ_CONCURRENCY") {
            cfg.dlq_concurrency = positive(key, &v)?;
        }
        if let Some((key, v)) = get("JOBWARD_POLL_INTERVAL_MS") {
            cfg.poll_interval = Duration::from_millis(positive(key, &v)?);
        }
        if let Some((key, v)) = get("JOBWARD_LEASE_MS") {
            cfg.lease_duration = Duration::from_millis(positive(key, &v)?);
        }
        if let Some((key, v)) = get("JOBWARD_ALERT_THRESHOLD") {
            cfg.alert_threshold = parse(key, &v)?;
        }
        if let Some((key, v)) = get("JOBWARD_MONITOR_INTERVAL_SECS") {
            cfg.monitor_interval = Duration::from_secs(positive(key, &v)?);
        }
        if let Some((key, v)) = get("JOBWARD_STALE_AFTER_SECS") {
            cfg.stale_after = Duration::from_secs(positive(key, &v)?);
        }
        if let Some((key, v)) = get("JOBWARD_CAPACITY_WARNING") {
            cfg.capacity_warning = parse(key, &v)?;
        }
        if let Some((key, v)) = get("JOBWARD_QUEUES") {
            let queues: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect();
            if queues.is_empty() {
                return Err(invalid(key, &v, "no queue names"));
            }
            cfg.queues = queues;
        }

        Ok(cfg)
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            lease_duration: self.lease_duration,
        }
    }

    pub fn dead_letter_workers(&self) -> DeadLetterWorkerConfig {
        DeadLetterWorkerConfig {
            concurrency: self.dlq_concurrency,
            poll_interval: self.poll_interval,
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            default_threshold: self.alert_threshold,
            interval: self.monitor_interval,
            stale_after: self.stale_after,
            capacity_warning: self.capacity_warning,
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| invalid(key, value, e.to_string()))
}

fn positive<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let n: T = parse(key, value)?;
    if n == T::default() {
        return Err(invalid(key, value, "must be greater than zero"));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(vars: &[(&str, &str)]) -> Result<QueueConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        QueueConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from(&[]).unwrap(), QueueConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let cfg = from(&[
            ("JOBWARD_WORKER_CONCURRENCY", "8"),
            ("JOBWARD_DLQ_CONCURRENCY", "2"),
            ("JOBWARD_POLL_INTERVAL_MS", "250"),
            ("JOBWARD_LEASE_MS", "60000"),
            ("JOBWARD_ALERT_THRESHOLD", "3"),
            ("JOBWARD_MONITOR_INTERVAL_SECS", "30"),
            ("JOBWARD_STALE_AFTER_SECS", "3600"),
            ("JOBWARD_CAPACITY_WARNING", "500"),
            ("JOBWARD_QUEUES", "import, reports ,,billing"),
        ])
        .unwrap();

        assert_eq!(cfg.worker_concurrency, 8);
        assert_eq!(cfg.dead_letter_workers().concurrency, 2);
        assert_eq!(cfg.worker().poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.worker().lease_duration, Duration::from_secs(60));
        assert_eq!(cfg.monitor().default_threshold, 3);
        assert_eq!(cfg.monitor().interval, Duration::from_secs(30));
        assert_eq!(cfg.monitor().stale_after, Duration::from_secs(3600));
        assert_eq!(cfg.monitor().capacity_warning, 500);
        assert_eq!(cfg.queues, vec!["import", "reports", "billing"]);
    }

    #[test]
    fn blank_values_are_ignored() {
        assert_eq!(from(&[("JOBWARD_WORKER_CONCURRENCY", "  ")]).unwrap().worker_concurrency, 4);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = from(&[("JOBWARD_WORKER_CONCURRENCY", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "JOBWARD_WORKER_CONCURRENCY", .. }));

        assert!(from(&[("JOBWARD_DLQ_CONCURRENCY", "0")]).is_err());
        assert!(from(&[("JOBWARD_LEASE_MS", "-5")]).is_err());
        assert!(from(&[("JOBWARD_QUEUES", ", ,")]).is_err());
    }

    #[test]
    fn zero_threshold_is_allowed() {
        assert_eq!(from(&[("JOBWARD_ALERT_THRESHOLD", "0")]).unwrap().alert_threshold, 0);
    }
}
