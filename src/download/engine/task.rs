use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, trace};

use crate::download::session::DownloadSession;
use crate::download::watchdog::DownloadHealthWatchdog;
use crate::storage::{
    Body, ByteRange, RateLimiter, RetryPolicy, StoreClient, TransferError, run_with_retry,
};

/// Everything a part task of one chunked download needs.
pub(super) struct PartContext {
    pub(super) store: StoreClient,
    pub(super) key: String,
    pub(super) session: Arc<DownloadSession>,
    pub(super) limiter: Arc<RateLimiter>,
    pub(super) watchdog: Arc<DownloadHealthWatchdog>,
    pub(super) retry: RetryPolicy,
}

/// Downloads one part into its own file, retrying whole attempts.
///
/// Latency from submission to completion is reported to the watchdog
/// whether or not the part succeeded.
pub(super) async fn download_part(
    context: Arc<PartContext>,
    seq: usize,
    range: ByteRange,
    priority: u64,
    submitted: Instant,
) -> Result<PathBuf, TransferError> {
    let label = format!("part {seq} of {}", context.key);
    let result = run_with_retry(&context.retry, &label, |attempt| {
        fetch_attempt(&context, seq, range, priority, attempt)
    })
    .await;

    let latency = submitted.elapsed();
    context.watchdog.observe(latency);
    debug!(
        seq,
        range = %range,
        latency_ms = latency.as_millis(),
        ok = result.is_ok(),
        "part finished"
    );
    result
}

async fn fetch_attempt(
    context: &PartContext,
    seq: usize,
    range: ByteRange,
    priority: u64,
    attempt: u32,
) -> Result<PathBuf, TransferError> {
    if context.session.is_closed() {
        return Err(TransferError::session_aborted(&context.key));
    }
    context.limiter.acquire().await;

    let Some(_active) = context.session.try_enter() else {
        return Err(TransferError::session_aborted(&context.key));
    };
    let root = context.session.root();
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| TransferError::io(root, e))?;

    let path = context.session.part_path(seq, priority, attempt);
    let started = Instant::now();
    let body = context.store.get_object(&context.key, Some(range)).await?;

    match write_part(body, &path).await {
        Ok(written) if written == range.len() => {
            context
                .store
                .slow_log()
                .check_transfer("GetObject", &context.key, written, started.elapsed());
            trace!(seq, attempt, written, "part written");
            Ok(path)
        }
        Ok(written) => {
            discard(&path).await;
            Err(TransferError::transport(
                "GetObject",
                context.key.as_str(),
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("part {seq} returned {written} of {} bytes", range.len()),
                ),
            ))
        }
        Err(error) => {
            discard(&path).await;
            Err(error)
        }
    }
}

async fn write_part(body: Body, path: &Path) -> Result<u64, TransferError> {
    let file = File::create(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = body.into_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(written)
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        trace!(path = %path.display(), error = %e, "could not discard partial part file");
    }
}
