//! Uploads and cross-store migrations.
//!
//! Both build on the same pieces: [`partition`] decides the part layout,
//! [`UploadSession`] owns the remote multipart lifecycle, and [`UploadPool`]
//! runs parts concurrently with retry and sibling cancellation.

mod migrate;
pub mod partition;
mod pool;
mod session;
mod upload;

pub use migrate::{MigrationCoordinator, MigrationOutcome, MigrationRecord};
pub use partition::{
    PartDescriptor, PartLimits, compute_part_size, plan_parts, plan_parts_from,
};
pub use pool::UploadPool;
pub use session::{UploadSession, UploadState};
pub use upload::{UploadCoordinator, UploadOutcome};
