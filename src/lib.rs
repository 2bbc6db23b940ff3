//! Objstore Core Library
//!
//! Parallel chunked transfer engine for HTTP object storage: multipart
//! upload, priority-scheduled chunked download with fast fallback, and
//! verified cross-store migration.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`storage`] - Request model, HTTP executor, typed backend operations,
//!   retry and rate limiting
//! - [`transfer`] - Part planning, multipart upload and migration
//! - [`download`] - Chunked download engine, priority pool, watchdog and
//!   scratch cleanup
//! - [`config`] - Client tunables loaded from TOML
//! - [`client`] - The [`ObjectStoreClient`] facade

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod download;
pub mod storage;
pub mod transfer;

// Re-export commonly used types
pub use client::{ClientBuildError, ObjectStoreClient};
pub use config::{ClientConfig, ConfigError};
pub use download::{ObjectBody, WatchdogSnapshot};
pub use storage::{ByteRange, ObjectMetadata, RequestExecutor, StoreClient, TransferError};
pub use transfer::{MigrationOutcome, UploadOutcome};
