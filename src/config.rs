//! Client configuration.
//!
//! [`ClientConfig`] carries every tunable of the transfer engine. All fields
//! have defaults, so a TOML file only needs the values it overrides:
//!
//! ```toml
//! download_workers = 8
//! fast_fallback_timeout_ms = 1500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::SlowLog;
use crate::storage::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_CHECKSUM_HEADER, READ_TIMEOUT_SECS};
use crate::transfer::PartLimits;

const MIB: u64 = 1024 * 1024;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`ClientConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Tunables for one [`ObjectStoreClient`](crate::ObjectStoreClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Uploads above this length use multipart.
    pub multipart_threshold: u64,
    /// Lower bound on upload part size.
    pub min_upload_part_size: u64,
    /// Upper bound on upload part count.
    pub max_upload_parts: u64,
    /// Concurrent part uploads per client.
    pub upload_workers: usize,

    /// Ranged downloads above this length may be chunked.
    pub download_multipart_threshold: u64,
    /// Lower bound on download part size.
    pub min_download_part_size: u64,
    /// Upper bound on download part count.
    pub max_download_parts: u64,
    /// Priority download pool size; 0 disables chunked downloads.
    pub download_workers: usize,
    /// Virtual-time spacing between consecutive parts of one session.
    pub download_task_interval_ms: u64,
    /// Wait on the first part before falling back to a single GET.
    pub fast_fallback_timeout_ms: u64,
    /// Wait on each subsequent part while streaming.
    pub chunk_read_timeout_ms: u64,
    /// Aggregate part requests per second; 0 disables limiting.
    pub download_qps: u32,

    /// Average part latency that marks chunked downloads unhealthy.
    pub watchdog_high_water_ms: u64,
    /// Average part latency below which they become healthy again.
    pub watchdog_low_water_ms: u64,
    /// Time for an unrefreshed latency average to lose half its weight.
    pub watchdog_half_life_ms: u64,

    /// Attempts per part (including the first).
    pub part_retry_attempts: u32,
    /// Base delay for exponential backoff between part attempts.
    pub retry_base_delay_ms: u64,

    /// Re-check interval while a session directory still has active tasks.
    pub cleanup_delay_ms: u64,
    /// Removal attempts per session directory.
    pub cleanup_max_attempts: u32,
    /// Root directory for part files.
    pub scratch_dir: PathBuf,

    /// Response header carrying the whole-object checksum.
    pub checksum_header: String,

    /// HTTP connect timeout for the bundled executor.
    pub connect_timeout_secs: u64,
    /// HTTP request timeout for the bundled executor.
    pub read_timeout_secs: u64,

    /// Uploads and part transfers slower than this are logged; 0 disables.
    pub slow_log_speed_bytes_per_sec: u64,
    /// CompleteMultipartUpload calls slower than this are logged; 0 disables.
    pub slow_log_time_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(4, std::num::NonZero::get);
        Self {
            multipart_threshold: 10 * MIB,
            min_upload_part_size: 10 * MIB,
            max_upload_parts: 10_000,
            upload_workers: parallelism * 2,
            download_multipart_threshold: 10 * MIB,
            min_download_part_size: 5 * MIB,
            max_download_parts: 10_000,
            download_workers: 0,
            download_task_interval_ms: 10,
            fast_fallback_timeout_ms: 3_000,
            chunk_read_timeout_ms: 60_000,
            download_qps: 100,
            watchdog_high_water_ms: 10_000,
            watchdog_low_water_ms: 5_000,
            watchdog_half_life_ms: 30_000,
            part_retry_attempts: 5,
            retry_base_delay_ms: 200,
            cleanup_delay_ms: 1_000,
            cleanup_max_attempts: 10,
            scratch_dir: std::env::temp_dir().join("objstore-chunks"),
            checksum_header: DEFAULT_CHECKSUM_HEADER.to_string(),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            slow_log_speed_bytes_per_sec: MIB,
            slow_log_time_ms: 5_000,
        }
    }
}

impl ClientConfig {
    /// Parses a TOML document and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`ClientConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 5] = [
            ("min_upload_part_size", self.min_upload_part_size),
            ("max_upload_parts", self.max_upload_parts),
            ("min_download_part_size", self.min_download_part_size),
            ("max_download_parts", self.max_download_parts),
            ("watchdog_half_life_ms", self.watchdog_half_life_ms),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::invalid(field, "must be greater than 0"));
        }
        if self.upload_workers == 0 {
            return Err(ConfigError::invalid("upload_workers", "must be greater than 0"));
        }
        if self.part_retry_attempts == 0 {
            return Err(ConfigError::invalid(
                "part_retry_attempts",
                "must be at least 1",
            ));
        }
        if self.watchdog_low_water_ms >= self.watchdog_high_water_ms {
            return Err(ConfigError::invalid(
                "watchdog_low_water_ms",
                format!(
                    "must be below watchdog_high_water_ms ({})",
                    self.watchdog_high_water_ms
                ),
            ));
        }
        if self.read_timeout_secs.saturating_mul(1000) < self.fast_fallback_timeout_ms {
            return Err(ConfigError::invalid(
                "read_timeout_secs",
                "must not be shorter than fast_fallback_timeout_ms",
            ));
        }
        Ok(())
    }

    /// Part sizing for uploads and migrations.
    #[must_use]
    pub fn upload_limits(&self) -> PartLimits {
        PartLimits::new(self.max_upload_parts, self.min_upload_part_size)
    }

    /// Part sizing for chunked downloads.
    #[must_use]
    pub fn download_limits(&self) -> PartLimits {
        PartLimits::new(self.max_download_parts, self.min_download_part_size)
    }

    /// Virtual-time spacing between parts.
    #[must_use]
    pub fn download_task_interval(&self) -> Duration {
        Duration::from_millis(self.download_task_interval_ms)
    }

    /// First-part wait.
    #[must_use]
    pub fn fast_fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_fallback_timeout_ms)
    }

    /// Per-part wait while streaming.
    #[must_use]
    pub fn chunk_read_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_read_timeout_ms)
    }

    /// Watchdog high water mark.
    #[must_use]
    pub fn watchdog_high_water(&self) -> Duration {
        Duration::from_millis(self.watchdog_high_water_ms)
    }

    /// Watchdog low water mark.
    #[must_use]
    pub fn watchdog_low_water(&self) -> Duration {
        Duration::from_millis(self.watchdog_low_water_ms)
    }

    /// Decay half-life of the watchdog average.
    #[must_use]
    pub fn watchdog_half_life(&self) -> Duration {
        Duration::from_millis(self.watchdog_half_life_ms)
    }

    /// Slow-request log thresholds.
    #[must_use]
    pub fn slow_log(&self) -> SlowLog {
        SlowLog::new(
            self.slow_log_speed_bytes_per_sec,
            Duration::from_millis(self.slow_log_time_ms),
        )
    }

    /// Backoff base delay.
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Janitor re-check interval.
    #[must_use]
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }
}
