//! Constants for the storage module (timeouts, headers, rate limiting).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large parts).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Warning threshold for cumulative rate limit delay (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Request header selecting the storage class of a new object.
pub const STORAGE_CLASS_HEADER: &str = "x-cos-storage-class";

/// Request header naming the source of a server-side copy.
pub const COPY_SOURCE_HEADER: &str = "x-cos-copy-source";

/// Default response header carrying a whole-object checksum.
pub const DEFAULT_CHECKSUM_HEADER: &str = "x-cos-hash-crc64ecma";
