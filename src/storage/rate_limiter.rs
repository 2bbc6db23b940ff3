//! Shared token-bucket rate limiting for backend requests.
//!
//! This module provides the [`RateLimiter`] struct which caps the aggregate
//! request rate of all chunked-download sessions of one client, shielding the
//! backend from the combined concurrency of many parallel downloads.
//!
//! # Overview
//!
//! The bucket holds up to `qps` tokens (one second of burst) and refills
//! continuously at `qps` tokens per second. Each [`RateLimiter::acquire`]
//! reserves one token; when the bucket is empty the caller sleeps until its
//! reservation matures. Reservations are handed out in call order.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use objstore_core::storage::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::new(50));
//!
//! let task_limiter = Arc::clone(&limiter);
//! tokio::spawn(async move {
//!     task_limiter.acquire().await;
//!     // ... issue request
//! });
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Shared token-bucket limiter.
///
/// Designed to be wrapped in `Arc` and shared across every part task of a
/// client. The bucket state sits behind a `tokio::sync::Mutex` held only for
/// the arithmetic, never across the sleep.
#[derive(Debug)]
pub struct RateLimiter {
    /// Permitted requests per second (0 when disabled).
    qps: u32,

    /// Whether rate limiting is disabled.
    disabled: bool,

    bucket: Mutex<Bucket>,

    /// Total time callers have been delayed (in milliseconds).
    cumulative_delay_ms: AtomicU64,
}

#[derive(Debug)]
struct Bucket {
    /// Available tokens; negative when reservations are outstanding.
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter allowing `qps` requests per second.
    ///
    /// A `qps` of 0 yields a disabled limiter.
    #[must_use]
    #[instrument(level = "debug")]
    pub fn new(qps: u32) -> Self {
        if qps == 0 {
            return Self::disabled();
        }
        debug!("creating rate limiter");
        Self {
            qps,
            disabled: false,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(qps),
                last_refill: Instant::now(),
            }),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Creates a disabled limiter that never delays.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            qps: 0,
            disabled: true,
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the configured requests per second.
    #[must_use]
    pub fn qps(&self) -> u32 {
        self.qps
    }

    /// Returns the total delay imposed on callers so far.
    #[must_use]
    pub fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::Relaxed))
    }

    /// Waits until one request may be issued.
    pub async fn acquire(&self) {
        if self.disabled {
            return;
        }

        let wait = {
            let mut bucket = self.bucket.lock().await;
            let now = Instant::now();
            let capacity = f64::from(self.qps);
            let refill = now.duration_since(bucket.last_refill).as_secs_f64() * capacity;
            bucket.tokens = (bucket.tokens + refill).min(capacity);
            bucket.last_refill = now;
            bucket.tokens -= 1.0;

            if bucket.tokens >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-bucket.tokens / capacity))
            }
        };

        if let Some(delay) = wait {
            let cumulative = self.add_cumulative_delay(delay);
            debug!(
                delay_ms = delay.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "applying rate limit delay"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD
                && cumulative.saturating_sub(delay) < CUMULATIVE_DELAY_WARNING_THRESHOLD
            {
                warn!(
                    qps = self.qps,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - chunked downloads are saturating the request budget"
                );
            }
            tokio::time::sleep(delay).await;
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::Relaxed)
            + delay_ms;
        Duration::from_millis(total)
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports integer seconds and HTTP-date (RFC 7231). Returns `None` if the
/// value cannot be parsed; caps excessive values at one hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use objstore_core::storage::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
        // Date already passed
        Err(_) => Some(Duration::ZERO),
    }
}
