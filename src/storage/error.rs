//! Error types for object-storage transfers.
//!
//! This module defines the single error taxonomy surfaced by every transfer
//! operation, carrying enough context (key, operation, status) for logs and
//! caller-facing messages.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Boxed source error used for transport failures from arbitrary executors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of a non-success backend response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// 404 - object or upload does not exist.
    NotFound,
    /// 409 - conflicting concurrent operation.
    Conflict,
    /// Any other 4xx.
    Client,
    /// 5xx.
    Server,
}

impl BackendErrorKind {
    /// Maps an HTTP status code to a backend error kind.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            409 => Self::Conflict,
            500..=599 => Self::Server,
            _ => Self::Client,
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Client => "client error",
            Self::Server => "server error",
        };
        f.write_str(label)
    }
}

/// Which wait expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// The bounded wait on the first chunk before falling back.
    FastFallback,
    /// A stream consumer waiting for the next chunk.
    ChunkRead,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FastFallback => f.write_str("fast-fallback"),
            Self::ChunkRead => f.write_str("chunk read"),
        }
    }
}

/// Errors that can occur during uploads, downloads and migrations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level failure (connect, reset, body stream error).
    #[error("transport error during {operation} of {key}: {source}")]
    Transport {
        /// Backend operation name.
        operation: &'static str,
        /// Object key.
        key: String,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },

    /// Backend returned a non-success status.
    #[error("{operation} of {key} failed with HTTP {status} ({kind})")]
    Backend {
        /// Backend operation name.
        operation: &'static str,
        /// Object key.
        key: String,
        /// HTTP status code.
        status: u16,
        /// Status classification.
        kind: BackendErrorKind,
        /// Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// Length or checksum mismatch after a transfer.
    #[error("integrity check failed for {key}: expected {field} {expected}, got {actual}")]
    Integrity {
        /// Destination key.
        key: String,
        /// Compared attribute (`length` or `checksum`).
        field: &'static str,
        /// Expected value.
        expected: String,
        /// Observed value.
        actual: String,
    },

    /// A bounded wait expired.
    #[error("{stage} timeout after {}ms for {key}", .after.as_millis())]
    Timeout {
        /// Object key.
        key: String,
        /// Which wait expired.
        stage: TimeoutStage,
        /// Configured bound.
        after: Duration,
    },

    /// A sibling part failed and the session was torn down.
    #[error("session for {key} was aborted by a sibling part failure")]
    SessionAborted {
        /// Object key.
        key: String,
    },

    /// Local file system failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Backend response was missing a required element.
    #[error("malformed {operation} response for {key}: {reason}")]
    Protocol {
        /// Backend operation name.
        operation: &'static str,
        /// Object key.
        key: String,
        /// What was wrong.
        reason: String,
    },

    /// Caller input was rejected before any remote call.
    #[error("invalid request for {key}: {reason}")]
    InvalidRequest {
        /// Object key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl TransferError {
    /// Creates a transport error.
    pub fn transport(
        operation: &'static str,
        key: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Transport {
            operation,
            key: key.into(),
            source: source.into(),
        }
    }

    /// Creates a backend status error.
    pub fn backend(operation: &'static str, key: impl Into<String>, status: u16) -> Self {
        Self::backend_with_retry_after(operation, key, status, None)
    }

    /// Creates a backend status error carrying a Retry-After value.
    pub fn backend_with_retry_after(
        operation: &'static str,
        key: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::Backend {
            operation,
            key: key.into(),
            status,
            kind: BackendErrorKind::from_status(status),
            retry_after,
        }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(
        key: impl Into<String>,
        field: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::Integrity {
            key: key.into(),
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(key: impl Into<String>, stage: TimeoutStage, after: Duration) -> Self {
        Self::Timeout {
            key: key.into(),
            stage,
            after,
        }
    }

    /// Creates a session-aborted error.
    pub fn session_aborted(key: impl Into<String>) -> Self {
        Self::SessionAborted { key: key.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a protocol error.
    pub fn protocol(
        operation: &'static str,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Protocol {
            operation,
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid-request error.
    pub fn invalid_request(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for a backend 404.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Backend {
                kind: BackendErrorKind::NotFound,
                ..
            }
        )
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>`: every variant needs a key
// or path that the source error does not carry.
