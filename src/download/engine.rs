//! Ranged downloads, optionally split into parallel parts.
//!
//! The engine serves every GetObject of a client. A ranged request is served
//! by parallel parts only when all of these hold:
//!
//! - a priority pool is configured;
//! - the range is longer than the download multipart threshold;
//! - the object exists;
//! - the [`DownloadHealthWatchdog`] reports healthy.
//!
//! Otherwise, and whenever the chunked path fails to get going (first part
//! slower than the fast-fallback timeout, any setup error), a single ranged
//! GET is issued instead. Only a failure of that single GET reaches the
//! caller.
//!
//! # Example
//!
//! ```no_run
//! use objstore_core::{ClientConfig, ObjectStoreClient};
//! use objstore_core::storage::ByteRange;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig { download_workers: 8, ..ClientConfig::default() };
//! let client = ObjectStoreClient::connect("http://127.0.0.1:9000/bucket/", config)?;
//! if let Some(body) = client.get_object("blobs/ab/cdef", Some(ByteRange::new(0, 64 << 20))).await? {
//!     let bytes = body.read_to_end().await?;
//!     println!("read {} bytes", bytes.len());
//! }
//! # Ok(())
//! # }
//! ```

mod stream;
mod task;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

pub use self::stream::{ChunkedDownload, ObjectBody};
use self::task::{PartContext, download_part};
use super::janitor::TempResourceJanitor;
use super::pool::PriorityPool;
use super::session::DownloadSession;
use super::watchdog::{DownloadHealthWatchdog, WatchdogSnapshot};
use crate::config::ClientConfig;
use crate::storage::{
    ByteRange, RateLimiter, RetryPolicy, StoreClient, TransferError, run_with_retry,
};
use crate::transfer::{PartLimits, plan_parts_from};

/// Download tunables taken from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Ranges above this length may be chunked.
    pub multipart_threshold: u64,
    /// Part sizing.
    pub limits: PartLimits,
    /// Virtual-time spacing between parts of one session.
    pub task_interval: Duration,
    /// First-part wait before falling back.
    pub fast_fallback_timeout: Duration,
    /// Per-part wait while streaming.
    pub chunk_read_timeout: Duration,
    /// Root for session scratch directories.
    pub scratch_dir: PathBuf,
}

impl From<&ClientConfig> for DownloadSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            multipart_threshold: config.download_multipart_threshold,
            limits: config.download_limits(),
            task_interval: config.download_task_interval(),
            fast_fallback_timeout: config.fast_fallback_timeout(),
            chunk_read_timeout: config.chunk_read_timeout(),
            scratch_dir: config.scratch_dir.clone(),
        }
    }
}

/// Serves GetObject, in parallel parts when worthwhile.
#[derive(Debug)]
pub struct ChunkedDownloadEngine {
    store: StoreClient,
    pool: Option<PriorityPool>,
    limiter: Arc<RateLimiter>,
    watchdog: Arc<DownloadHealthWatchdog>,
    janitor: TempResourceJanitor,
    retry: RetryPolicy,
    settings: DownloadSettings,
}

impl ChunkedDownloadEngine {
    /// Creates an engine. Without a `pool` every download is a single GET.
    #[must_use]
    pub fn new(
        store: StoreClient,
        pool: Option<PriorityPool>,
        limiter: Arc<RateLimiter>,
        watchdog: Arc<DownloadHealthWatchdog>,
        janitor: TempResourceJanitor,
        retry: RetryPolicy,
        settings: DownloadSettings,
    ) -> Self {
        debug!(
            workers = pool.as_ref().map_or(0, PriorityPool::workers),
            threshold = settings.multipart_threshold,
            qps = limiter.qps(),
            "download engine ready"
        );
        Self {
            store,
            pool,
            limiter,
            watchdog,
            janitor,
            retry,
            settings,
        }
    }

    /// Health figures of the chunked path.
    #[must_use]
    pub fn health(&self) -> WatchdogSnapshot {
        self.watchdog
            .snapshot(self.pool.as_ref().map_or(0, PriorityPool::queued))
    }

    /// Scratch cleanup tracker.
    #[must_use]
    pub fn janitor(&self) -> &TempResourceJanitor {
        &self.janitor
    }

    /// Returns `key` (or the inclusive `range` of it).
    ///
    /// Returns `Ok(None)` when the object does not exist.
    ///
    /// # Errors
    ///
    /// Failures of the single-request GET. Chunked-path failures are logged
    /// and answered with a single GET instead.
    #[instrument(skip(self), fields(range = ?range))]
    pub async fn get_object(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<ObjectBody>, TransferError> {
        let Some(range) = range.filter(|range| self.wants_chunks(*range)) else {
            return self.single_get(key, range).await;
        };

        let length = match self.store.head_object(key).await {
            Ok(metadata) => metadata.length,
            Err(error) if error.is_not_found() => {
                debug!("object does not exist");
                return Ok(None);
            }
            Err(error) => {
                warn!(error = %error, "existence check failed, using single request");
                return self.single_get(key, Some(range)).await;
            }
        };

        // Ranges running past the end are served up to the last byte.
        let Some(range) = clamp_to_length(range, length) else {
            debug!(length, "range starts past the end, using single request");
            return self.single_get(key, Some(range)).await;
        };
        if !self.wants_chunks(range) {
            return self.single_get(key, Some(range)).await;
        }

        if !self.watchdog.is_healthy() {
            debug!("watchdog unhealthy, using single request");
            return self.single_get(key, Some(range)).await;
        }

        match self.chunked_load(key, range).await {
            Ok(download) => Ok(Some(ObjectBody::chunked(download))),
            Err(error) => {
                warn!(error = %error, "chunked download did not start, falling back to single request");
                self.single_get(key, Some(range)).await
            }
        }
    }

    fn wants_chunks(&self, range: ByteRange) -> bool {
        self.pool.is_some() && range.len() > self.settings.multipart_threshold
    }

    async fn single_get(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<ObjectBody>, TransferError> {
        let store = &self.store;
        let label = format!("GetObject {key}");
        match run_with_retry(&self.retry, &label, move |_| store.get_object(key, range)).await {
            Ok(body) => Ok(Some(ObjectBody::single(body))),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn chunked_load(
        &self,
        key: &str,
        range: ByteRange,
    ) -> Result<ChunkedDownload, TransferError> {
        let Some(pool) = self.pool.as_ref() else {
            return Err(TransferError::invalid_request(key, "no download pool"));
        };

        let length = range.len();
        let parts = plan_parts_from(range.start, length, self.settings.limits.part_size(length));
        let session = DownloadSession::new(&self.settings.scratch_dir, pool.virtual_now());
        self.watchdog.register(session.id(), parts.len());

        let context = Arc::new(PartContext {
            store: self.store.clone(),
            key: key.to_string(),
            session: Arc::clone(&session),
            limiter: Arc::clone(&self.limiter),
            watchdog: Arc::clone(&self.watchdog),
            retry: self.retry.clone(),
        });

        let interval_ms = u64::try_from(self.settings.task_interval.as_millis()).unwrap_or(u64::MAX);
        let submit = |seq: usize, range: ByteRange| {
            let priority = session
                .start_virtual()
                .saturating_add((seq as u64).saturating_mul(interval_ms));
            pool.submit(
                priority,
                download_part(Arc::clone(&context), seq, range, priority, Instant::now()),
            )
        };

        // Only the first part is queued until it proves the path is fast.
        let Some((first, rest)) = parts.split_first() else {
            return Err(TransferError::invalid_request(key, "empty range"));
        };
        let mut download = ChunkedDownload::new(
            key,
            length,
            Arc::clone(&session),
            vec![submit(0, first.byte_range())],
            self.settings.chunk_read_timeout,
            Arc::clone(&self.watchdog),
            self.janitor.clone(),
        );

        let waited = Instant::now();
        if let Err(error) = download
            .await_first(self.settings.fast_fallback_timeout)
            .await
        {
            if matches!(error, TransferError::Timeout { .. }) {
                self.watchdog.observe(waited.elapsed());
            }
            return Err(error);
        }

        download.extend(
            rest.iter()
                .enumerate()
                .map(|(index, part)| submit(index + 1, part.byte_range())),
        );
        info!(
            session = session.id(),
            parts = parts.len(),
            length,
            "chunked download started"
        );
        Ok(download)
    }
}

/// Trims `range` to an object of `length` bytes; `None` when it starts past
/// the end.
fn clamp_to_length(range: ByteRange, length: u64) -> Option<ByteRange> {
    let last = length.checked_sub(1)?;
    (range.start <= last).then(|| ByteRange::new(range.start, range.end.min(last)))
}
