//! Bounded retries with exponential backoff for transport calls

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Configuration for exponential backoff between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per retry (typically 2.0)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Random jitter factor (0.0 = none, 1.0 = up to ±50%)
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: 0.0,
        }
    }
}

impl BackoffConfig {
    /// No waiting between attempts
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(retry as i32);
        let delay = base.min(self.max_delay_ms as f64);

        let jitter = if self.jitter_factor > 0.0 {
            delay * self.jitter_factor * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Final result of a retried call and the retries it took
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, TransportError>,
    pub retries: u32,
}

/// Run `op` up to `attempts` times, each bounded by `timeout`.
///
/// Only retryable errors (network, timeout) trigger another attempt.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    timeout: Duration,
    backoff: &BackoffConfig,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = attempts.max(1);
    let mut retries = 0;

    loop {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        };

        match result {
            Err(err) if err.is_retryable() && retries + 1 < attempts => {
                let delay = backoff.delay_for(retries);
                debug!(attempt = retries + 1, ?delay, error = %err, "retrying transport call");
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            result => return Attempted { result, retries },
        }
    }
}
