//! Direct object migration between two stores.
//!
//! Each part is a ranged GET on the source streamed straight into an
//! UploadPart on the destination, so object bytes never touch local disk.
//! The destination is verified against the source's length (and checksum,
//! when the source exposes one) after Complete; a mismatch deletes the
//! destination.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::partition::PartLimits;
use super::pool::UploadPool;
use super::session::UploadSession;
use crate::storage::{
    Body, ObjectMetadata, PartResult, RetryPolicy, StoreClient, TransferError, run_with_retry,
};

/// Bookkeeping for one migration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Source key.
    pub source_key: String,
    /// Destination key.
    pub destination_key: String,
    /// Length reported by the source.
    pub expected_length: u64,
    /// Checksum reported by the source, if any.
    pub expected_checksum: Option<String>,
    /// Uploaded parts, ascending.
    pub parts: Vec<PartResult>,
}

impl MigrationRecord {
    fn new(source: &ObjectMetadata, destination_key: &str) -> Self {
        Self {
            source_key: source.key.clone(),
            destination_key: destination_key.to_string(),
            expected_length: source.length,
            expected_checksum: source.checksum.clone(),
            parts: Vec::new(),
        }
    }

    /// Compares the destination metadata against the source's.
    ///
    /// # Errors
    ///
    /// [`TransferError::Integrity`] naming the first mismatching field.
    pub fn verify(&self, destination: &ObjectMetadata) -> Result<(), TransferError> {
        if destination.length != self.expected_length {
            return Err(TransferError::integrity(
                &self.destination_key,
                "length",
                self.expected_length,
                destination.length,
            ));
        }
        if let Some(expected) = &self.expected_checksum {
            let actual = destination.checksum.as_deref();
            if actual != Some(expected.as_str()) {
                return Err(TransferError::integrity(
                    &self.destination_key,
                    "checksum",
                    expected,
                    actual.unwrap_or("<missing>"),
                ));
            }
        }
        Ok(())
    }
}

/// Result of a verified migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    /// Source key.
    pub source_key: String,
    /// Destination key.
    pub destination_key: String,
    /// Bytes copied.
    pub length: u64,
    /// Verified checksum, when the source exposed one.
    pub checksum: Option<String>,
    /// Number of parts; 0 for an empty object.
    pub parts: usize,
}

/// Copies objects from a source store into this client's store.
#[derive(Debug, Clone)]
pub struct MigrationCoordinator {
    destination: StoreClient,
    pool: UploadPool,
    retry: RetryPolicy,
    limits: PartLimits,
}

impl MigrationCoordinator {
    /// Creates a coordinator writing into `destination`.
    #[must_use]
    pub fn new(
        destination: StoreClient,
        pool: UploadPool,
        retry: RetryPolicy,
        limits: PartLimits,
    ) -> Self {
        Self {
            destination,
            pool,
            retry,
            limits,
        }
    }

    /// Copies `source_key` from `source` to `destination_key` and verifies it.
    ///
    /// There is no whole-migration retry: individual requests are retried,
    /// anything beyond that is returned to the caller.
    ///
    /// # Errors
    ///
    /// Source HEAD failures, part failures (after the destination upload is
    /// aborted), destination HEAD failures and [`TransferError::Integrity`]
    /// (both after the destination is deleted).
    #[instrument(skip(self, source))]
    pub async fn migrate(
        &self,
        source: &StoreClient,
        source_key: &str,
        destination_key: &str,
        storage_class: Option<&str>,
    ) -> Result<MigrationOutcome, TransferError> {
        let source_metadata = self
            .with_retry(&format!("head {source_key}"), || source.head_object(source_key))
            .await?;
        let mut record = MigrationRecord::new(&source_metadata, destination_key);
        debug!(
            length = record.expected_length,
            checksum = ?record.expected_checksum,
            "source object resolved"
        );

        if record.expected_length == 0 {
            self.with_retry(&format!("put {destination_key}"), || {
                self.destination
                    .put_object(destination_key, Body::Empty, storage_class)
            })
            .await?;
        } else {
            record.parts = self
                .copy_parts(source, &record, storage_class)
                .await?;
        }

        self.verify(&record).await?;
        info!(
            %source_key,
            %destination_key,
            length = record.expected_length,
            parts = record.parts.len(),
            "migration verified"
        );
        Ok(MigrationOutcome {
            source_key: record.source_key,
            destination_key: record.destination_key,
            length: record.expected_length,
            checksum: record.expected_checksum,
            parts: record.parts.len(),
        })
    }

    async fn copy_parts(
        &self,
        source: &StoreClient,
        record: &MigrationRecord,
        storage_class: Option<&str>,
    ) -> Result<Vec<PartResult>, TransferError> {
        let session = Arc::new(
            UploadSession::initiate(
                self.destination.clone(),
                &record.destination_key,
                storage_class,
                &self.retry,
            )
            .await?,
        );
        let parts = self.limits.plan(record.expected_length);
        let part_session = Arc::clone(&session);
        let source = source.clone();
        let source_key = record.source_key.clone();

        let result = self
            .pool
            .run_parts(&session, parts, &self.retry, move |part, attempt| {
                let session = Arc::clone(&part_session);
                let source = source.clone();
                let source_key = source_key.clone();
                async move {
                    debug!(part_number = part.number, attempt, range = %part.byte_range(), "migrating part");
                    let body = source
                        .get_object(&source_key, Some(part.byte_range()))
                        .await?;
                    let body = Body::stream(body.into_stream(), part.size());
                    session.upload_part(part.number, body).await
                }
            })
            .await;

        let sorted = result.map(|mut results| {
            results.sort_by_key(|part| part.part_number);
            results
        });
        let uploaded = sorted.as_ref().ok().cloned();
        session.conclude(sorted).await?;
        Ok(uploaded.unwrap_or_default())
    }

    /// Confirms the destination or removes it. An unverifiable destination
    /// (HEAD failing after retries) is removed as well.
    async fn verify(&self, record: &MigrationRecord) -> Result<(), TransferError> {
        let key = record.destination_key.as_str();
        let failure = match self
            .with_retry(&format!("head {key}"), || self.destination.head_object(key))
            .await
        {
            Ok(metadata) => match record.verify(&metadata) {
                Ok(()) => return Ok(()),
                Err(mismatch) => mismatch,
            },
            Err(error) => error,
        };

        warn!(%key, error = %failure, "destination failed verification, deleting it");
        if let Err(error) = self
            .with_retry(&format!("delete {key}"), || self.destination.delete_object(key))
            .await
        {
            error!(%key, error = %error, "failed to delete unverified destination");
        }
        Err(failure)
    }

    async fn with_retry<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, TransferError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, TransferError>>,
    {
        run_with_retry(&self.retry, label, |_| operation()).await
    }
}
