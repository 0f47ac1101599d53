//! Bounded exponential backoff for upstream calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;

/// Retry policy applied to transient gateway failures.
///
/// Delay before attempt `n` (1-based, after the first failure) is
/// `base_delay * factor^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    pub factor: u32,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            factor: 2,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        let multiplier = self.factor.max(1).saturating_pow(exp);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Non-transient errors (`TxNotFound`, `InvalidInput`, ...) return on the
/// first attempt. A transient error that survives every attempt is
/// reported as `Unavailable` naming `what`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt >= max_attempts => {
                return Err(match err {
                    CoreError::Unavailable { .. } => err,
                    other => CoreError::unavailable(
                        what,
                        format!("{other} (after {attempt} attempts)"),
                    ),
                });
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    what,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient upstream failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
