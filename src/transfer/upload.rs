//! Single-request and multipart uploads.
//!
//! Objects at or below the multipart threshold go up in one PutObject.
//! Larger objects are split by the [`PartLimits`] and uploaded as a multipart
//! session:
//!
//! - seekable sources (files, in-memory bytes) submit every part to the
//!   shared [`UploadPool`] at once, re-reading the slice on each attempt;
//! - non-seekable readers are consumed one part at a time and uploaded
//!   sequentially.
//!
//! A failed part aborts the whole session remotely before the error is
//! returned, so no upload is ever left dangling on the backend.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument};

use super::partition::{PartDescriptor, PartLimits};
use super::pool::UploadPool;
use super::session::UploadSession;
use crate::storage::{Body, PartResult, RetryPolicy, StoreClient, TransferError, run_with_retry};

/// Result of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    /// Destination key.
    pub key: String,
    /// Uploaded length in bytes.
    pub length: u64,
    /// ETag reported by the backend, if any.
    pub etag: Option<String>,
    /// Multipart upload id; `None` for a single PutObject.
    pub upload_id: Option<String>,
    /// Number of parts; 0 for a single PutObject.
    pub parts: usize,
}

/// Uploads objects, choosing between single and multipart requests.
#[derive(Debug, Clone)]
pub struct UploadCoordinator {
    store: StoreClient,
    pool: UploadPool,
    retry: RetryPolicy,
    multipart_threshold: u64,
    limits: PartLimits,
}

impl UploadCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        store: StoreClient,
        pool: UploadPool,
        retry: RetryPolicy,
        multipart_threshold: u64,
        limits: PartLimits,
    ) -> Self {
        Self {
            store,
            pool,
            retry,
            multipart_threshold,
            limits,
        }
    }

    /// Returns true when `length` bytes go up in a single PutObject.
    #[must_use]
    pub fn is_single_request(&self, length: u64) -> bool {
        length == 0 || length <= self.multipart_threshold
    }

    /// Uploads the file at `path` to `key`.
    ///
    /// # Errors
    ///
    /// [`TransferError::InvalidRequest`] if the file does not exist (checked
    /// before any remote call), otherwise the first unrecoverable part or
    /// session failure.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn put_file(
        &self,
        key: &str,
        path: &Path,
        storage_class: Option<&str>,
    ) -> Result<UploadOutcome, TransferError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::invalid_request(
                    key,
                    format!("source file {} does not exist", path.display()),
                ));
            }
            Err(e) => return Err(TransferError::io(path, e)),
        };
        if !metadata.is_file() {
            return Err(TransferError::invalid_request(
                key,
                format!("source {} is not a regular file", path.display()),
            ));
        }
        let length = metadata.len();

        if self.is_single_request(length) {
            return self
                .put_single(key, length, storage_class, || {
                    Body::from_file_slice(path, 0, length)
                })
                .await;
        }

        let session = Arc::new(
            UploadSession::initiate(self.store.clone(), key, storage_class, &self.retry).await?,
        );
        let parts = self.limits.plan(length);
        let path = path.to_path_buf();
        let part_session = Arc::clone(&session);

        let result = self
            .pool
            .run_parts(&session, parts.clone(), &self.retry, move |part, attempt| {
                let session = Arc::clone(&part_session);
                let path = path.clone();
                async move {
                    debug!(part_number = part.number, attempt, size = part.size(), "uploading file part");
                    let body = Body::from_file_slice(&path, part.start, part.size()).await?;
                    session.upload_part(part.number, body).await
                }
            })
            .await;

        Self::finish(&session, length, &parts, result).await
    }

    /// Uploads in-memory bytes to `key`.
    ///
    /// # Errors
    ///
    /// The first unrecoverable part or session failure.
    #[instrument(skip(self, bytes), fields(length = bytes.len()))]
    pub async fn put_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        storage_class: Option<&str>,
    ) -> Result<UploadOutcome, TransferError> {
        let length = bytes.len() as u64;
        if self.is_single_request(length) {
            return self
                .put_single(key, length, storage_class, || {
                    let body = Body::Bytes(bytes.clone());
                    async move { Ok(body) }
                })
                .await;
        }

        let session = Arc::new(
            UploadSession::initiate(self.store.clone(), key, storage_class, &self.retry).await?,
        );
        let parts = self.limits.plan(length);
        let part_session = Arc::clone(&session);

        let result = self
            .pool
            .run_parts(&session, parts.clone(), &self.retry, move |part, _| {
                let session = Arc::clone(&part_session);
                let slice = slice_part(&bytes, &part);
                async move { session.upload_part(part.number, Body::Bytes(slice)).await }
            })
            .await;

        Self::finish(&session, length, &parts, result).await
    }

    /// Uploads exactly `length` bytes read from `reader` to `key`.
    ///
    /// Parts are read and uploaded one after another. A reader that ends
    /// before `length` bytes is rejected and the session aborted.
    ///
    /// # Errors
    ///
    /// [`TransferError::InvalidRequest`] for a short stream, otherwise the
    /// first unrecoverable part or session failure.
    #[instrument(skip(self, reader))]
    pub async fn put_stream<R>(
        &self,
        key: &str,
        mut reader: R,
        length: u64,
        storage_class: Option<&str>,
    ) -> Result<UploadOutcome, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.is_single_request(length) {
            let bytes = read_exact_part(&mut reader, length, key).await?;
            return self
                .put_single(key, length, storage_class, || {
                    let body = Body::Bytes(bytes.clone());
                    async move { Ok(body) }
                })
                .await;
        }

        let session =
            UploadSession::initiate(self.store.clone(), key, storage_class, &self.retry).await?;
        let parts = self.limits.plan(length);
        session.begin_parts();

        let mut results = Vec::with_capacity(parts.len());
        let mut failure = None;
        for part in &parts {
            let chunk = match read_exact_part(&mut reader, part.size(), key).await {
                Ok(chunk) => chunk,
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            };
            let label = format!("part {} of {key}", part.number);
            let uploaded = run_with_retry(&self.retry, &label, |_| {
                session.upload_part(part.number, Body::Bytes(chunk.clone()))
            })
            .await;
            match uploaded {
                Ok(result) => results.push(result),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        let result = match failure {
            Some(error) => {
                session.mark_aborted();
                Err(error)
            }
            None => Ok(results),
        };
        Self::finish(&session, length, &parts, result).await
    }

    async fn put_single<F, Fut>(
        &self,
        key: &str,
        length: u64,
        storage_class: Option<&str>,
        body: F,
    ) -> Result<UploadOutcome, TransferError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Body, TransferError>>,
    {
        let label = format!("put {key}");
        let etag = run_with_retry(&self.retry, &label, |_| {
            let body = body();
            async move {
                let body = body.await?;
                self.store.put_object(key, body, storage_class).await
            }
        })
        .await?;

        info!(%key, length, "object uploaded");
        Ok(UploadOutcome {
            key: key.to_string(),
            length,
            etag,
            upload_id: None,
            parts: 0,
        })
    }

    async fn finish(
        session: &UploadSession,
        length: u64,
        parts: &[PartDescriptor],
        result: Result<Vec<PartResult>, TransferError>,
    ) -> Result<UploadOutcome, TransferError> {
        let etag = session.conclude(result).await?;
        info!(key = %session.key(), length, parts = parts.len(), "multipart upload finished");
        Ok(UploadOutcome {
            key: session.key().to_string(),
            length,
            etag,
            upload_id: Some(session.upload_id().to_string()),
            parts: parts.len(),
        })
    }
}

/// Reads exactly `size` bytes, rejecting a stream that ends early.
async fn read_exact_part<R>(reader: &mut R, size: u64, key: &str) -> Result<Bytes, TransferError>
where
    R: AsyncRead + Unpin,
{
    let capacity = usize::try_from(size)
        .map_err(|_| TransferError::invalid_request(key, "part does not fit in memory"))?;
    let mut buffer = Vec::with_capacity(capacity);
    (&mut *reader)
        .take(size)
        .read_to_end(&mut buffer)
        .await
        .map_err(|e| TransferError::transport("ReadSource", key, e))?;

    if buffer.len() as u64 != size {
        return Err(TransferError::invalid_request(
            key,
            format!(
                "source stream ended after {} of {size} expected bytes",
                buffer.len()
            ),
        ));
    }
    Ok(Bytes::from(buffer))
}

#[allow(clippy::cast_possible_truncation)]
fn slice_part(bytes: &Bytes, part: &PartDescriptor) -> Bytes {
    bytes.slice(part.start as usize..=part.end as usize)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_exact_part_rejects_short_stream() {
        let mut reader: &[u8] = b"abc";
        let result = read_exact_part(&mut reader, 5, "k").await;
        assert!(matches!(result, Err(TransferError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_read_exact_part_reads_sequential_slices() {
        let mut reader: &[u8] = b"abcdefg";
        assert_eq!(read_exact_part(&mut reader, 3, "k").await.unwrap(), "abc");
        assert_eq!(read_exact_part(&mut reader, 3, "k").await.unwrap(), "def");
        assert_eq!(read_exact_part(&mut reader, 1, "k").await.unwrap(), "g");
    }

    #[test]
    fn test_slice_part() {
        let bytes = Bytes::from_static(b"0123456789");
        let part = PartDescriptor {
            number: 2,
            start: 4,
            end: 7,
        };
        assert_eq!(slice_part(&bytes, &part), Bytes::from_static(b"4567"));
    }
}
