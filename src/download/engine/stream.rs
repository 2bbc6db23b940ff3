use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use crate::download::janitor::TempResourceJanitor;
use crate::download::pool::PoolHandle;
use crate::download::session::DownloadSession;
use crate::download::watchdog::DownloadHealthWatchdog;
use crate::storage::{Body, ByteStream, FILE_CHUNK_SIZE, TimeoutStage, TransferError};

type PartOutput = Result<PathBuf, TransferError>;

enum Slot {
    Ready(PartOutput),
    Pending(PoolHandle<PartOutput>),
}

struct CurrentPart {
    path: PathBuf,
    file: File,
}

/// Sequential reader over the parts of one chunked download.
///
/// Parts are consumed strictly in offset order regardless of the order in
/// which they finish. Each part file is deleted once read. Closing (or
/// dropping) the download cancels every outstanding part and hands the
/// scratch directory to the janitor.
pub struct ChunkedDownload {
    key: String,
    length: u64,
    session: Arc<DownloadSession>,
    slots: VecDeque<Slot>,
    current: Option<CurrentPart>,
    chunk_read_timeout: Duration,
    watchdog: Arc<DownloadHealthWatchdog>,
    janitor: TempResourceJanitor,
    closed: bool,
}

impl std::fmt::Debug for ChunkedDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedDownload")
            .field("key", &self.key)
            .field("length", &self.length)
            .field("session", &self.session.id())
            .field("remaining_parts", &self.slots.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ChunkedDownload {
    pub(super) fn new(
        key: &str,
        length: u64,
        session: Arc<DownloadSession>,
        handles: Vec<PoolHandle<PartOutput>>,
        chunk_read_timeout: Duration,
        watchdog: Arc<DownloadHealthWatchdog>,
        janitor: TempResourceJanitor,
    ) -> Self {
        Self {
            key: key.to_string(),
            length,
            session,
            slots: handles.into_iter().map(Slot::Pending).collect(),
            current: None,
            chunk_read_timeout,
            watchdog,
            janitor,
            closed: false,
        }
    }

    /// Appends parts behind the ones already queued.
    pub(super) fn extend(&mut self, handles: impl IntoIterator<Item = PoolHandle<PartOutput>>) {
        self.slots.extend(handles.into_iter().map(Slot::Pending));
    }

    /// Total bytes this download yields.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Session id, also the scratch directory name.
    #[must_use]
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Waits up to `wait` for the first part.
    ///
    /// # Errors
    ///
    /// A fast-fallback [`TransferError::Timeout`] or the first part's error.
    pub(super) async fn await_first(&mut self, wait: Duration) -> Result<(), TransferError> {
        let handle = match self.slots.pop_front() {
            Some(Slot::Pending(handle)) => handle,
            Some(ready) => {
                self.slots.push_front(ready);
                return Ok(());
            }
            None => return Ok(()),
        };

        match tokio::time::timeout(wait, handle).await {
            Ok(Some(Ok(path))) => {
                self.slots.push_front(Slot::Ready(Ok(path)));
                Ok(())
            }
            Ok(Some(Err(error))) => Err(error),
            Ok(None) => Err(TransferError::session_aborted(&self.key)),
            Err(_) => Err(TransferError::timeout(
                &self.key,
                TimeoutStage::FastFallback,
                wait,
            )),
        }
    }

    /// Returns the next chunk of bytes, or `None` at the end.
    ///
    /// # Errors
    ///
    /// A chunk-read [`TransferError::Timeout`] when the next part does not
    /// arrive in time, the part's own error, or a local IO error. The
    /// download is closed after any error.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        let result = self.advance().await;
        if !matches!(result, Ok(Some(_))) {
            self.close();
        }
        result
    }

    async fn advance(&mut self) -> Result<Option<Bytes>, TransferError> {
        loop {
            if let Some(current) = self.current.as_mut() {
                let mut buffer = BytesMut::with_capacity(FILE_CHUNK_SIZE);
                let read = current
                    .file
                    .read_buf(&mut buffer)
                    .await
                    .map_err(|e| TransferError::io(&current.path, e))?;
                if read > 0 {
                    return Ok(Some(buffer.freeze()));
                }
                if let Some(done) = self.current.take() {
                    consume(done).await;
                }
                continue;
            }

            if self.closed {
                return Ok(None);
            }
            let Some(slot) = self.slots.pop_front() else {
                return Ok(None);
            };

            let path = match slot {
                Slot::Ready(output) => output?,
                Slot::Pending(handle) => {
                    match tokio::time::timeout(self.chunk_read_timeout, handle).await {
                        Ok(Some(output)) => output?,
                        Ok(None) => return Err(TransferError::session_aborted(&self.key)),
                        Err(_) => {
                            return Err(TransferError::timeout(
                                &self.key,
                                TimeoutStage::ChunkRead,
                                self.chunk_read_timeout,
                            ));
                        }
                    }
                }
            };

            let file = File::open(&path)
                .await
                .map_err(|e| TransferError::io(&path, e))?;
            self.current = Some(CurrentPart { path, file });
        }
    }

    /// Cancels outstanding parts and schedules scratch cleanup. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let cancelled = self
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count();
        self.slots.clear();
        self.current = None;

        self.session.close();
        self.watchdog.unregister(self.session.id());
        self.janitor.schedule(Arc::clone(&self.session));
        debug!(
            session = self.session.id(),
            cancelled,
            elapsed_ms = self.session.elapsed().as_millis(),
            "chunked download closed"
        );
    }

    /// Converts the download into a byte stream.
    #[must_use]
    pub fn into_stream(self) -> ByteStream {
        futures_util::stream::try_unfold(self, |mut download| async move {
            let chunk = download.next_chunk().await?;
            Ok::<_, TransferError>(chunk.map(|chunk| (chunk, download)))
        })
        .boxed()
    }
}

impl Drop for ChunkedDownload {
    fn drop(&mut self) {
        self.close();
    }
}

async fn consume(part: CurrentPart) {
    let CurrentPart { path, file } = part;
    drop(file);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        trace!(path = %path.display(), error = %e, "could not remove consumed part");
    }
}

enum Inner {
    Single(ByteStream),
    Chunked(Box<ChunkedDownload>),
}

/// Object content returned by a download, fetched either over one
/// connection or as parallel parts.
///
/// Both variants expose the same pull API and yield bytes in offset order.
pub struct ObjectBody {
    inner: Inner,
    length: u64,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Inner::Single(_) => write!(f, "ObjectBody::Single({} bytes)", self.length),
            Inner::Chunked(download) => write!(f, "ObjectBody::{download:?}"),
        }
    }
}

impl ObjectBody {
    /// Wraps a single-request response body.
    #[must_use]
    pub fn single(body: Body) -> Self {
        let length = body.len();
        Self {
            inner: Inner::Single(body.into_stream()),
            length,
        }
    }

    /// Wraps a chunked download.
    #[must_use]
    pub fn chunked(download: ChunkedDownload) -> Self {
        Self {
            length: download.length(),
            inner: Inner::Chunked(Box::new(download)),
        }
    }

    /// Declared length in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Returns true when the body is served by parallel parts.
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        matches!(self.inner, Inner::Chunked(_))
    }

    /// Returns the next chunk, or `None` at the end.
    ///
    /// # Errors
    ///
    /// Transport, timeout or local IO errors.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        match &mut self.inner {
            Inner::Single(stream) => stream.next().await.transpose(),
            Inner::Chunked(download) => download.next_chunk().await,
        }
    }

    /// Buffers the whole body.
    ///
    /// # Errors
    ///
    /// See [`ObjectBody::next_chunk`].
    pub async fn read_to_end(mut self) -> Result<Bytes, TransferError> {
        let capacity = usize::try_from(self.length).unwrap_or(0);
        let mut buffer = BytesMut::with_capacity(capacity);
        while let Some(chunk) = self.next_chunk().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// Converts the body into a byte stream.
    #[must_use]
    pub fn into_stream(self) -> ByteStream {
        match self.inner {
            Inner::Single(stream) => stream,
            Inner::Chunked(download) => (*download).into_stream(),
        }
    }
}
