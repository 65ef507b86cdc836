//! Generic exponential-backoff retry loop.
//!
//! The only consumer today is the buildsys XML-RPC `getBuild` enrichment
//! call (§4.6), which needs 5 attempts, factor 3, jittered, 1s→60s — but the
//! loop itself is not specific to that client, following the shape of the
//! teacher's sidecar-connect retry layer.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant, SystemTime};

/// Backoff configuration for a [`retry_async`] loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial attempt. `0`
    /// means only the initial attempt (no retries).
    pub max_retries: u32,
    /// Multiplicative backoff factor applied per attempt
    /// (`delay = base_delay * factor^attempt`).
    pub factor: u32,
    /// Base delay for exponential backoff.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Maximum delay cap for exponential backoff.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Jitter factor in `[0.0, 1.0]`. `0` = no jitter, `1` = full jitter.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            factor: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.5,
        }
    }
}

impl RetryConfig {
    /// The buildsys `getBuild` enrichment retry policy from §4.6 and
    /// §3.7's `buildsys_retry_*` configuration fields: 5 attempts, factor
    /// 3, jittered, 1s→60s.
    #[must_use]
    pub fn buildsys_default() -> Self {
        Self {
            max_retries: 5,
            factor: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_millis().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Record of a single failed attempt.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// Zero-indexed attempt number.
    pub attempt: u32,
    /// Error message from this attempt.
    pub error: String,
    /// Backoff delay applied before the next attempt.
    pub delay: Duration,
}

/// Metadata captured across all retry attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryMetadata {
    /// Total number of attempts made (including the successful one).
    pub total_attempts: u32,
    /// Records of each *failed* attempt.
    pub failed_attempts: Vec<RetryAttempt>,
    /// Wall-clock time spanning all attempts.
    pub total_duration: Duration,
}

/// Result of a retry-enabled operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The successfully produced value.
    pub value: T,
    /// Retry metadata (empty `failed_attempts` when the first attempt succeeds).
    pub metadata: RetryMetadata,
}

/// Error returned when a [`retry_async`] loop exhausts its retry budget or
/// exceeds no-progress time. Wraps the last underlying error.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation's own error, either non-retryable or from the final
    /// exhausted attempt.
    #[error("{0}")]
    Operation(E),
    /// The overall timeout elapsed between attempts.
    #[error("overall retry timeout of {0:?} exceeded")]
    Timeout(Duration),
}

/// Compute the backoff delay for a given zero-indexed attempt number.
#[must_use]
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = (config.factor as u64).saturating_pow(attempt);
    let delay_ms = (config.base_delay.as_millis() as u64).saturating_mul(exp);
    let capped_ms = delay_ms.min(config.max_delay.as_millis() as u64);

    let jitter_factor = config.jitter_factor.clamp(0.0, 1.0);
    if jitter_factor > 0.0 && capped_ms > 0 {
        let jitter_range = (capped_ms as f64 * jitter_factor) as u64;
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        let pseudo = nanos.wrapping_mul(attempt as u64 + 1);
        let jitter = if jitter_range > 0 {
            pseudo % jitter_range
        } else {
            0
        };
        Duration::from_millis(capped_ms.saturating_sub(jitter))
    } else {
        Duration::from_millis(capped_ms)
    }
}

/// Generic retry loop. Calls `op` up to `max_retries + 1` times with
/// exponential backoff, returning the first successful result along with
/// metadata about failed attempts.
///
/// `retryable` decides whether a given error should trigger a retry; a
/// non-retryable error returns immediately without consuming further
/// budget.
pub async fn retry_async<T, E, F, Fut>(
    config: &RetryConfig,
    mut op: F,
    retryable: impl Fn(&E) -> bool,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let max_attempts = config.max_retries + 1;
    let mut failed_attempts = Vec::new();

    for attempt in 0..max_attempts {
        tracing::debug!(target: "kaijs::retry", attempt, max_attempts, "attempting operation");

        match op().await {
            Ok(value) => {
                let total_duration = start.elapsed();
                tracing::debug!(
                    target: "kaijs::retry",
                    attempt,
                    total_duration_ms = total_duration.as_millis() as u64,
                    "operation succeeded"
                );
                return Ok(RetryOutcome {
                    value,
                    metadata: RetryMetadata {
                        total_attempts: attempt + 1,
                        failed_attempts,
                        total_duration,
                    },
                });
            }
            Err(err) => {
                let is_last = attempt + 1 >= max_attempts;

                if !retryable(&err) {
                    tracing::debug!(target: "kaijs::retry", error = %err, "non-retryable error, giving up");
                    return Err(RetryError::Operation(err));
                }

                if is_last {
                    tracing::warn!(target: "kaijs::retry", error = %err, attempt, "retry budget exhausted");
                    return Err(RetryError::Operation(err));
                }

                let delay = compute_delay(config, attempt);
                tracing::warn!(
                    target: "kaijs::retry",
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retryable error, backing off"
                );

                failed_attempts.push(RetryAttempt {
                    attempt,
                    error: err.to_string(),
                    delay,
                });

                tokio::time::sleep(delay).await;
            }
        }
    }

    unreachable!("loop always returns within max_attempts iterations")
}
