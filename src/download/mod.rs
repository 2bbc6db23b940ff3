//! Parallel chunked downloads with single-request fallback.
//!
//! # Layout
//!
//! - [`ChunkedDownloadEngine`] decides per request whether to split a ranged
//!   GET into parts and falls back to one request when the split path is
//!   unavailable or slow to start.
//! - [`PriorityPool`] runs part tasks across all sessions of a client, lowest
//!   virtual deadline first, so earlier sessions and earlier parts win.
//! - [`DownloadHealthWatchdog`] gates the chunked path on observed latency.
//! - [`TempResourceJanitor`] removes session scratch directories once their
//!   last task has left.

mod engine;
mod janitor;
mod pool;
mod session;
mod watchdog;

pub use engine::{ChunkedDownload, ChunkedDownloadEngine, DownloadSettings, ObjectBody};
pub use janitor::TempResourceJanitor;
pub use pool::{PoolHandle, PriorityPool};
pub use session::{ActiveTaskGuard, DownloadSession};
pub use watchdog::{DownloadHealthWatchdog, WatchdogSnapshot};
