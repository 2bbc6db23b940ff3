//! Retry logic with exponential backoff for individual backend operations.
//!
//! Every part upload, part download and migration part runs through
//! [`run_with_retry`], which re-issues the operation with unchanged parameters
//! until it succeeds, fails permanently, or the attempt budget is exhausted.
//!
//! # Example
//!
//! ```
//! use objstore_core::storage::{FailureType, RetryDecision, RetryPolicy, TransferError, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = TransferError::backend("UploadPart", "blobs/key", 503);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::TransferError;
use super::rate_limiter::parse_retry_after;

/// Default attempts per operation (including the first).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for exponential backoff.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);

/// Default maximum delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Backoff multiplier (doubles each attempt).
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Classification of transfer failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry (transport, 5xx, 408).
    Transient,

    /// Failure that will not succeed regardless of retries.
    Permanent,

    /// Backend throttling (HTTP 429); retried, honouring Retry-After.
    RateLimited,
}

/// Decision on whether to retry a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// Delays follow `min(base_delay * 2^(attempt-1), max_delay) + jitter`, where
/// jitter is at most half the base delay. A zero base delay retries
/// immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy.
    ///
    /// `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Creates a policy with a custom attempt budget and default delays.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry after `attempt` (1-indexed) failed.
    #[instrument(level = "trace", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        RetryDecision::Retry {
            delay: self.calculate_delay(attempt),
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = (base_ms * BACKOFF_MULTIPLIER.powf(exponent))
            .min(self.max_delay.as_millis() as f64);

        let max_jitter_ms = (self.base_delay.as_millis() / 2) as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);

        Duration::from_millis(delay_ms as u64 + jitter_ms)
    }
}

/// Classifies a transfer error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | Transport | Transient |
/// | Timeout | Transient |
/// | Backend 408 / 5xx | Transient |
/// | Backend 429 | RateLimited |
/// | Backend other 4xx | Permanent |
/// | Integrity, SessionAborted, Io, Protocol, InvalidRequest | Permanent |
#[must_use]
pub fn classify_error(error: &TransferError) -> FailureType {
    match error {
        TransferError::Transport { .. } | TransferError::Timeout { .. } => FailureType::Transient,
        TransferError::Backend { status, .. } => classify_http_status(*status),
        TransferError::Integrity { .. }
        | TransferError::SessionAborted { .. }
        | TransferError::Io { .. }
        | TransferError::Protocol { .. }
        | TransferError::InvalidRequest { .. } => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Runs `operation` until it succeeds or the policy gives up.
///
/// The closure receives the 1-indexed attempt number. The last error is
/// returned unchanged once retries are exhausted or the failure is permanent.
///
/// # Errors
///
/// Returns the final attempt's [`TransferError`].
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, TransferError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let failure_type = classify_error(&error);
        let retry_after = match (&error, failure_type) {
            (
                TransferError::Backend {
                    retry_after: Some(value),
                    ..
                },
                FailureType::RateLimited,
            ) => parse_retry_after(value),
            _ => None,
        };

        match policy.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay: backoff_delay,
                attempt: next_attempt,
            } => {
                let delay = retry_after.unwrap_or(backoff_delay);
                warn!(
                    %label,
                    attempt = next_attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    using_retry_after = retry_after.is_some(),
                    error = %error,
                    "retrying operation"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(%label, %reason, attempts = attempt, "not retrying operation");
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts(), 1);
        assert_eq!(fast_policy(0).max_attempts(), 1);
    }

    #[test]
    fn test_should_retry_transient_until_exhausted() {
        let policy = fast_policy(3);
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 3),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_should_not_retry_permanent() {
        let policy = fast_policy(5);
        match policy.should_retry(FailureType::Permanent, 1) {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("permanent")),
            other => panic!("expected DoNotRetry, got {other:?}"),
        }
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(300));
        let first = policy.calculate_delay(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let third = policy.calculate_delay(3);
        assert!(third >= Duration::from_millis(300) && third <= Duration::from_millis(350));
    }

    #[test]
    fn test_zero_base_delay_has_no_jitter() {
        assert_eq!(fast_policy(3).calculate_delay(2), Duration::ZERO);
    }

    #[test]
    fn test_classify_error_table() {
        assert_eq!(
            classify_error(&TransferError::backend("GetObject", "k", 503)),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&TransferError::backend("GetObject", "k", 408)),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&TransferError::backend("GetObject", "k", 429)),
            FailureType::RateLimited
        );
        assert_eq!(
            classify_error(&TransferError::backend("GetObject", "k", 404)),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&TransferError::session_aborted("k")),
            FailureType::Permanent
        );
        let io = std::io::Error::other("boom");
        assert_eq!(
            classify_error(&TransferError::transport("GetObject", "k", io)),
            FailureType::Transient
        );
    }

    #[tokio::test]
    async fn test_run_with_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&fast_policy(5), "UploadPart", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(TransferError::backend("UploadPart", "k", 500))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_with_retry_stops_on_permanent_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_with_retry(&fast_policy(5), "UploadPart", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransferError::backend("UploadPart", "k", 403)) }
        })
        .await;

        assert!(matches!(result, Err(TransferError::Backend { status: 403, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_with_retry_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_with_retry(&fast_policy(4), "GetObject", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransferError::backend("GetObject", "k", 502)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
