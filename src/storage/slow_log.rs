//! Slow-request logging.
//!
//! Body-carrying requests are judged by throughput, commit-style requests by
//! wall time. Bodies smaller than a few seconds' worth of the speed threshold
//! are never reported since their throughput is dominated by round-trip
//! latency.

use std::time::Duration;

use tracing::warn;

/// Transfers below `speed * SMALL_TRANSFER_FACTOR` bytes are not judged.
const SMALL_TRANSFER_FACTOR: u64 = 5;

/// Thresholds for slow-request warnings. A zero threshold disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowLog {
    speed_bytes_per_sec: u64,
    time: Duration,
}

impl Default for SlowLog {
    fn default() -> Self {
        Self::disabled()
    }
}

impl SlowLog {
    /// Creates thresholds; zero disables the respective check.
    #[must_use]
    pub fn new(speed_bytes_per_sec: u64, time: Duration) -> Self {
        Self {
            speed_bytes_per_sec,
            time,
        }
    }

    /// Never reports anything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Returns true when `bytes` moved in `elapsed` is below the speed
    /// threshold.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn is_slow_transfer(&self, bytes: u64, elapsed: Duration) -> bool {
        if self.speed_bytes_per_sec == 0
            || bytes < self.speed_bytes_per_sec.saturating_mul(SMALL_TRANSFER_FACTOR)
        {
            return false;
        }
        let secs = elapsed.as_secs_f64();
        secs > 0.0 && (bytes as f64 / secs) < self.speed_bytes_per_sec as f64
    }

    /// Returns true when a call took longer than the time threshold.
    #[must_use]
    pub fn is_slow_call(&self, elapsed: Duration) -> bool {
        !self.time.is_zero() && elapsed > self.time
    }

    /// Warns when a body transfer was slow; returns whether it did.
    #[allow(clippy::cast_precision_loss)]
    pub fn check_transfer(&self, operation: &str, key: &str, bytes: u64, elapsed: Duration) -> bool {
        let slow = self.is_slow_transfer(bytes, elapsed);
        if slow {
            let speed_kib = bytes as f64 / 1024.0 / elapsed.as_secs_f64();
            warn!(
                operation,
                %key,
                bytes,
                elapsed_ms = elapsed.as_millis(),
                speed_kib_per_sec = speed_kib,
                threshold_kib_per_sec = self.speed_bytes_per_sec / 1024,
                "slow transfer"
            );
        }
        slow
    }

    /// Warns when a call was slow; returns whether it was.
    pub fn check_call(&self, operation: &str, key: &str, elapsed: Duration) -> bool {
        let slow = self.is_slow_call(elapsed);
        if slow {
            warn!(
                operation,
                %key,
                elapsed_ms = elapsed.as_millis(),
                threshold_ms = self.time.as_millis(),
                "slow request"
            );
        }
        slow
    }
}
