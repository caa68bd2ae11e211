//! Backoff delay calculation.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::strategy::RetryStrategy;

/// Jitter applied on top of the computed delay (±10%).
pub const JITTER_RATIO: f64 = 0.1;

/// How the delay grows with the attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Same delay for every attempt.
    Fixed,
    /// `base * attempts`
    Linear,
    /// `base * 2^(attempts - 1)`
    #[default]
    Exponential,
}

/// Delay in milliseconds before jitter, with the strategy's cap applied.
///
/// `attempts` is the number of executions made so far; `0` is treated as `1`.
pub fn base_backoff(attempts: u32, strategy: &RetryStrategy) -> u64 {
    let attempts = attempts.max(1);
    let base = strategy.backoff_delay_ms;

    let delay = match strategy.backoff_type {
        BackoffType::Fixed => base,
        BackoffType::Linear => base.saturating_mul(u64::from(attempts)),
        BackoffType::Exponential => 2u64
            .checked_pow(attempts - 1)
            .map_or(u64::MAX, |factor| base.saturating_mul(factor)),
    };

    match strategy.max_backoff_delay_ms {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}

/// Delay before the next attempt, with ±10% uniform jitter.
pub fn calculate_backoff(attempts: u32, strategy: &RetryStrategy) -> Duration {
    calculate_backoff_with(&mut rand::thread_rng(), attempts, strategy)
}

/// Same as [`calculate_backoff`] with an explicit random source.
pub fn calculate_backoff_with<R: Rng + ?Sized>(
    rng: &mut R,
    attempts: u32,
    strategy: &RetryStrategy,
) -> Duration {
    let base = base_backoff(attempts, strategy) as f64;
    let factor = rng.gen_range(-JITTER_RATIO..=JITTER_RATIO);
    let jittered = (base * (1.0 + factor)).round().max(0.0);
    Duration::from_millis(jittered as u64)
}
