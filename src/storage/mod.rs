//! Backend access layer.
//!
//! Everything that talks to the object store lives here: the request model
//! and [`RequestExecutor`] seam, the bundled reqwest executor, the typed
//! [`StoreClient`] operations, and the shared retry and rate-limit policies.

mod backend;
pub mod constants;
mod error;
mod http;
mod rate_limiter;
mod retry;
mod slow_log;
mod store;

pub use backend::{
    Body, ByteRange, ByteStream, FILE_CHUNK_SIZE, ObjectRequest, ObjectResponse, Operation,
    PartResult, RequestExecutor,
};
pub use error::{BackendErrorKind, BoxError, TimeoutStage, TransferError};
pub use http::{HttpExecutor, default_user_agent};
pub use rate_limiter::{RateLimiter, parse_retry_after};
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, FailureType, RetryDecision, RetryPolicy, classify_error,
    run_with_retry,
};
pub use slow_log::SlowLog;
pub use store::{ObjectMetadata, StoreClient, parse_upload_id};
