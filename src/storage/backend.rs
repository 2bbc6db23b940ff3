//! Request/response model shared with the injected request executor.
//!
//! The engine speaks in terms of typed [`ObjectRequest`]s; turning them into
//! signed HTTP calls is the executor's job. [`HttpExecutor`](super::HttpExecutor)
//! is the bundled reqwest implementation, tests inject in-memory ones.

use std::fmt;
use std::io::SeekFrom;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::TransferError;

/// Read size when streaming local files.
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// A boxed stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// Inclusive byte range, as sent in an HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

impl ByteRange {
    /// Creates a range; `end` is inclusive.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    /// Always false: an inclusive range covers at least one byte.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Range` header value.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// One uploaded part and the ETag the backend returned for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartResult {
    /// 1-based part number.
    pub part_number: u32,
    /// Opaque per-part token.
    pub etag: String,
}

/// Backend operations consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Fetch object metadata.
    HeadObject,
    /// Fetch object content, optionally a byte range.
    GetObject {
        /// Requested range; `None` for the whole object.
        range: Option<ByteRange>,
    },
    /// Single-request upload.
    PutObject {
        /// Optional storage class.
        storage_class: Option<String>,
    },
    /// Open a multipart session.
    InitiateMultipartUpload {
        /// Optional storage class.
        storage_class: Option<String>,
    },
    /// Upload one part of a session.
    UploadPart {
        /// Session handle.
        upload_id: String,
        /// 1-based part number.
        part_number: u32,
    },
    /// Commit a session; parts must be ascending.
    CompleteMultipartUpload {
        /// Session handle.
        upload_id: String,
        /// Ordered part list.
        parts: Vec<PartResult>,
    },
    /// Discard a session and its parts.
    AbortMultipartUpload {
        /// Session handle.
        upload_id: String,
    },
    /// Server-side copy from another key.
    CopyObject {
        /// Source key.
        source_key: String,
    },
    /// Existence probe.
    CheckObjectExist,
    /// Delete an object.
    DeleteObject,
}

impl Operation {
    /// Stable operation name used in errors and logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::HeadObject => "HeadObject",
            Self::GetObject { .. } => "GetObject",
            Self::PutObject { .. } => "PutObject",
            Self::InitiateMultipartUpload { .. } => "InitiateMultipartUpload",
            Self::UploadPart { .. } => "UploadPart",
            Self::CompleteMultipartUpload { .. } => "CompleteMultipartUpload",
            Self::AbortMultipartUpload { .. } => "AbortMultipartUpload",
            Self::CopyObject { .. } => "CopyObject",
            Self::CheckObjectExist => "CheckObjectExist",
            Self::DeleteObject => "DeleteObject",
        }
    }
}

/// Request or response payload.
pub enum Body {
    /// No payload.
    Empty,
    /// Fully buffered payload.
    Bytes(Bytes),
    /// Streamed payload of known length.
    Stream {
        /// Chunk stream.
        stream: ByteStream,
        /// Declared length in bytes.
        length: u64,
    },
}

impl Body {
    /// Wraps a stream with its declared length.
    #[must_use]
    pub fn stream(stream: ByteStream, length: u64) -> Self {
        Self::Stream { stream, length }
    }

    /// Streams `length` bytes of the file at `path`, starting at `offset`.
    ///
    /// The file is opened eagerly so a missing source fails here, not
    /// mid-request.
    ///
    /// # Errors
    ///
    /// [`TransferError::Io`] if the file cannot be opened or seeked.
    pub async fn from_file_slice(
        path: &Path,
        offset: u64,
        length: u64,
    ) -> Result<Self, TransferError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| TransferError::io(path, e))?;
        }

        let state = (file.take(length), path.to_path_buf());
        let stream = futures_util::stream::try_unfold(state, |(mut reader, path)| async move {
            let mut buffer = BytesMut::with_capacity(FILE_CHUNK_SIZE);
            let read = reader
                .read_buf(&mut buffer)
                .await
                .map_err(|e| TransferError::io(&path, e))?;
            if read == 0 {
                return Ok::<_, TransferError>(None);
            }
            Ok(Some((buffer.freeze(), (reader, path))))
        });
        Ok(Self::stream(stream.boxed(), length))
    }

    /// Declared length of the payload.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::Stream { length, .. } => *length,
        }
    }

    /// Returns true when the payload is declared empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts the payload into a chunk stream.
    #[must_use]
    pub fn into_stream(self) -> ByteStream {
        match self {
            Self::Empty => futures_util::stream::empty().boxed(),
            Self::Bytes(bytes) => futures_util::stream::once(async move { Ok(bytes) }).boxed(),
            Self::Stream { stream, .. } => stream,
        }
    }

    /// Buffers the whole payload in memory.
    ///
    /// # Errors
    ///
    /// Returns the first error yielded by a streamed payload.
    pub async fn collect(self) -> Result<Bytes, TransferError> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Bytes(bytes) => Ok(bytes),
            Self::Stream { mut stream, length } => {
                let capacity = usize::try_from(length).unwrap_or(0);
                let mut buffer = BytesMut::with_capacity(capacity);
                while let Some(chunk) = stream.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                Ok(buffer.freeze())
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Self::Stream { length, .. } => write!(f, "Body::Stream({length} bytes)"),
        }
    }
}

/// A typed request handed to the executor.
#[derive(Debug)]
pub struct ObjectRequest {
    /// Operation to perform.
    pub operation: Operation,
    /// Object key.
    pub key: String,
    /// Request payload.
    pub body: Body,
}

impl ObjectRequest {
    /// Creates a request without a payload.
    pub fn new(operation: Operation, key: impl Into<String>) -> Self {
        Self {
            operation,
            key: key.into(),
            body: Body::Empty,
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }
}

/// Raw executor response.
#[derive(Debug)]
pub struct ObjectResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response payload.
    pub body: Body,
}

impl ObjectResponse {
    /// Returns true for a 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns a header as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Executes signed requests against the object store.
///
/// Implementations own authentication, endpoint resolution and HTTP. Network
/// failures must be returned as [`TransferError::Transport`]; non-2xx
/// statuses are returned as responses, not errors.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Executes one request.
    async fn execute(&self, request: ObjectRequest) -> Result<ObjectResponse, TransferError>;
}
