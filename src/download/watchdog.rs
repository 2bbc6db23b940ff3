//! Health tracking for chunked downloads.
//!
//! The watchdog folds every finished part's latency (submission to
//! completion, so pool queueing counts) into an exponentially weighted moving
//! average. Chunked downloads are switched off while the average sits above
//! the high water mark and switched back on only once it falls below the low
//! water mark. Nothing ever blocks on it: updates are atomic and readers take
//! a snapshot.
//!
//! The average decays with a configurable half-life while no samples arrive.
//! An unhealthy watchdog stops chunked downloads and with them its own
//! samples, so without decay it could never recover.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Weight of the newest sample in the moving average.
const EWMA_ALPHA: f64 = 0.2;

/// Point-in-time view of chunked-download health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogSnapshot {
    /// Whether chunked downloads are currently enabled.
    pub healthy: bool,
    /// Moving average of part latency in milliseconds.
    pub average_latency_ms: f64,
    /// Samples folded in so far.
    pub samples: u64,
    /// Chunked downloads currently open.
    pub active_sessions: usize,
    /// Parts waiting for a pool worker.
    pub queued_parts: usize,
}

#[derive(Debug)]
struct SessionEntry {
    parts: usize,
    registered: Instant,
}

/// Per-client health monitor for the chunked download path.
#[derive(Debug)]
pub struct DownloadHealthWatchdog {
    high_water: Duration,
    low_water: Duration,
    half_life: Duration,
    epoch: Instant,
    /// `f64` bits of the average latency in milliseconds as of the last sample.
    average_ms: AtomicU64,
    /// Microseconds since `epoch` of the last sample.
    last_sample_us: AtomicU64,
    samples: AtomicU64,
    healthy: AtomicBool,
    sessions: DashMap<String, SessionEntry>,
}

impl DownloadHealthWatchdog {
    /// Creates a healthy watchdog with the given water marks and decay
    /// half-life.
    #[must_use]
    pub fn new(high_water: Duration, low_water: Duration, half_life: Duration) -> Self {
        Self {
            high_water,
            low_water,
            half_life,
            epoch: Instant::now(),
            average_ms: AtomicU64::new(0f64.to_bits()),
            last_sample_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            sessions: DashMap::new(),
        }
    }

    /// Returns true while chunked downloads may be used.
    ///
    /// An unhealthy watchdog re-evaluates its decayed average here, so it
    /// recovers once old samples have aged out.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        if self.healthy.load(Ordering::Acquire) {
            return true;
        }
        self.evaluate(self.average_ms());
        self.healthy.load(Ordering::Acquire)
    }

    /// Current moving average, decayed to now.
    #[must_use]
    pub fn average_latency(&self) -> Duration {
        Duration::from_secs_f64(self.average_ms() / 1000.0)
    }

    fn average_ms(&self) -> f64 {
        let stored = f64::from_bits(self.average_ms.load(Ordering::Acquire));
        let last = self.last_sample_us.load(Ordering::Acquire);
        self.decay(stored, last, self.now_us())
    }

    fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    #[allow(clippy::cast_precision_loss)]
    fn decay(&self, average_ms: f64, last_us: u64, now_us: u64) -> f64 {
        let half_life_us = self.half_life.as_micros() as f64;
        if half_life_us <= 0.0 {
            return average_ms;
        }
        let age_us = now_us.saturating_sub(last_us) as f64;
        average_ms * 0.5f64.powf(age_us / half_life_us)
    }

    /// Folds one latency sample in and re-evaluates health.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe(&self, latency: Duration) {
        let sample = latency.as_micros() as f64 / 1000.0;
        let now = self.now_us();
        let last = self.last_sample_us.swap(now, Ordering::AcqRel);
        let first = self.samples.fetch_add(1, Ordering::AcqRel) == 0;
        let fold = |stored: f64| {
            if first {
                sample
            } else {
                let current = self.decay(stored, last, now);
                current + EWMA_ALPHA * (sample - current)
            }
        };

        let previous = self
            .average_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(fold(f64::from_bits(bits)).to_bits())
            })
            .unwrap_or_else(|bits| bits);
        self.evaluate(fold(f64::from_bits(previous)));
    }

    fn evaluate(&self, average_ms: f64) {
        let high = self.high_water.as_secs_f64() * 1000.0;
        let low = self.low_water.as_secs_f64() * 1000.0;

        if average_ms > high
            && self
                .healthy
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            warn!(
                average_latency_ms = average_ms,
                high_water_ms = high,
                "chunked downloads unhealthy, falling back to single requests"
            );
        } else if average_ms < low
            && self
                .healthy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            info!(
                average_latency_ms = average_ms,
                low_water_ms = low,
                "chunked downloads healthy again"
            );
        }
    }

    /// Tracks an open chunked download.
    pub fn register(&self, session_id: &str, parts: usize) {
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                parts,
                registered: Instant::now(),
            },
        );
    }

    /// Stops tracking a chunked download.
    pub fn unregister(&self, session_id: &str) {
        if let Some((_, entry)) = self.sessions.remove(session_id) {
            debug!(
                session = session_id,
                parts = entry.parts,
                open_ms = entry.registered.elapsed().as_millis(),
                "session unregistered"
            );
        }
    }

    /// Open chunked downloads.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Current health figures; `queued_parts` comes from the pool.
    #[must_use]
    pub fn snapshot(&self, queued_parts: usize) -> WatchdogSnapshot {
        WatchdogSnapshot {
            healthy: self.is_healthy(),
            average_latency_ms: self.average_ms(),
            samples: self.samples.load(Ordering::Acquire),
            active_sessions: self.active_sessions(),
            queued_parts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog() -> DownloadHealthWatchdog {
        DownloadHealthWatchdog::new(
            Duration::from_millis(1000),
            Duration::from_millis(500),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_starts_healthy() {
        let watchdog = watchdog();
        assert!(watchdog.is_healthy());
        assert_eq!(watchdog.snapshot(0).samples, 0);
    }

    #[test]
    fn test_first_sample_sets_average() {
        let watchdog = watchdog();
        watchdog.observe(Duration::from_millis(300));
        let average = watchdog.snapshot(0).average_latency_ms;
        assert!((average - 300.0).abs() < 1e-3, "average {average}");
    }

    #[test]
    fn test_flips_unhealthy_above_high_water() {
        let watchdog = watchdog();
        watchdog.observe(Duration::from_millis(5000));
        assert!(!watchdog.is_healthy());
    }

    #[test]
    fn test_hysteresis_between_water_marks() {
        let watchdog = watchdog();
        watchdog.observe(Duration::from_millis(5000));
        assert!(!watchdog.is_healthy());

        // Decays toward 700ms: below high water but above low water.
        for _ in 0..50 {
            watchdog.observe(Duration::from_millis(700));
        }
        assert!(watchdog.average_latency() < Duration::from_millis(1000));
        assert!(!watchdog.is_healthy());

        for _ in 0..50 {
            watchdog.observe(Duration::from_millis(100));
        }
        assert!(watchdog.is_healthy());
    }

    #[test]
    fn test_recovers_without_samples_once_average_decays() {
        let watchdog = DownloadHealthWatchdog::new(
            Duration::from_millis(1000),
            Duration::from_millis(500),
            Duration::from_millis(10),
        );
        watchdog.observe(Duration::from_millis(5000));
        assert!(!watchdog.is_healthy());

        // 20 half-lives: 5000ms decays to well below the low water mark.
        std::thread::sleep(Duration::from_millis(200));
        assert!(watchdog.is_healthy());
        assert!(watchdog.average_latency() < Duration::from_millis(500));
        assert_eq!(watchdog.snapshot(0).samples, 1);
    }

    #[test]
    fn test_stale_average_weighs_less_than_fresh_sample() {
        let watchdog = DownloadHealthWatchdog::new(
            Duration::from_millis(1000),
            Duration::from_millis(500),
            Duration::from_millis(10),
        );
        watchdog.observe(Duration::from_millis(5000));
        std::thread::sleep(Duration::from_millis(200));
        watchdog.observe(Duration::from_millis(100));
        // Folded against the decayed average, not the stale 5000ms.
        assert!(watchdog.average_latency() < Duration::from_millis(500));
        assert!(watchdog.is_healthy());
    }

    #[test]
    fn test_single_spike_is_smoothed() {
        let watchdog = watchdog();
        for _ in 0..10 {
            watchdog.observe(Duration::from_millis(100));
        }
        watchdog.observe(Duration::from_millis(3000));
        // 100 + 0.2 * 2900 = 680
        assert!(watchdog.is_healthy());
    }

    #[test]
    fn test_session_registry() {
        let watchdog = watchdog();
        watchdog.register("a", 4);
        watchdog.register("b", 2);
        assert_eq!(watchdog.snapshot(3).active_sessions, 2);
        assert_eq!(watchdog.snapshot(3).queued_parts, 3);
        watchdog.unregister("a");
        watchdog.unregister("a");
        assert_eq!(watchdog.active_sessions(), 1);
    }
}
