//! Typed backend operations over an injected [`RequestExecutor`].
//!
//! [`StoreClient`] issues exactly one request per call and maps the response
//! into domain values or a [`TransferError`]. It never retries: retry and
//! abort policy belong to the coordinators.

use std::sync::Arc;
use std::time::Instant;

use reqwest::header::{CONTENT_LENGTH, ETAG, RETRY_AFTER};
use serde::Serialize;
use tracing::{debug, instrument};

use super::backend::{
    Body, ByteRange, ObjectRequest, ObjectResponse, Operation, PartResult, RequestExecutor,
};
use super::constants::{DEFAULT_CHECKSUM_HEADER, STORAGE_CLASS_HEADER};
use super::slow_log::SlowLog;
use super::TransferError;

/// Metadata returned by a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMetadata {
    /// Object key.
    pub key: String,
    /// Content length in bytes.
    pub length: u64,
    /// ETag, if the backend sent one.
    pub etag: Option<String>,
    /// Whole-object checksum, if the backend exposes one.
    pub checksum: Option<String>,
    /// Storage class, if reported.
    pub storage_class: Option<String>,
}

/// Typed operations against one bucket/endpoint.
#[derive(Clone)]
pub struct StoreClient {
    executor: Arc<dyn RequestExecutor>,
    checksum_header: String,
    slow_log: SlowLog,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("checksum_header", &self.checksum_header)
            .field("slow_log", &self.slow_log)
            .finish_non_exhaustive()
    }
}

impl StoreClient {
    /// Creates a store client using the default checksum header.
    #[must_use]
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Self {
        Self::with_checksum_header(executor, DEFAULT_CHECKSUM_HEADER)
    }

    /// Creates a store client reading checksums from `checksum_header`.
    #[must_use]
    pub fn with_checksum_header(
        executor: Arc<dyn RequestExecutor>,
        checksum_header: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            checksum_header: checksum_header.into().to_ascii_lowercase(),
            slow_log: SlowLog::disabled(),
        }
    }

    /// Enables slow-request warnings for uploads and commits.
    #[must_use]
    pub fn with_slow_log(mut self, slow_log: SlowLog) -> Self {
        self.slow_log = slow_log;
        self
    }

    /// Slow-request thresholds in use.
    #[must_use]
    pub fn slow_log(&self) -> &SlowLog {
        &self.slow_log
    }

    /// Issues HeadObject.
    ///
    /// # Errors
    ///
    /// Backend status errors (including 404), transport errors, or a
    /// protocol error when Content-Length is missing.
    #[instrument(level = "debug", skip(self))]
    pub async fn head_object(&self, key: &str) -> Result<ObjectMetadata, TransferError> {
        let operation = Operation::HeadObject;
        let name = operation.name();
        let response = self.send(ObjectRequest::new(operation, key)).await?;

        let length = response
            .header(CONTENT_LENGTH.as_str())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| TransferError::protocol(name, key, "missing Content-Length"))?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            length,
            etag: response.header(ETAG.as_str()).map(unquote_etag),
            checksum: response.header(&self.checksum_header).map(str::to_string),
            storage_class: response.header(STORAGE_CLASS_HEADER).map(str::to_string),
        })
    }

    /// Issues CheckObjectExist; a 404 maps to `false`.
    ///
    /// # Errors
    ///
    /// Any non-404 failure.
    #[instrument(level = "debug", skip(self))]
    pub async fn check_object_exist(&self, key: &str) -> Result<bool, TransferError> {
        match self
            .send(ObjectRequest::new(Operation::CheckObjectExist, key))
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Issues GetObject and returns the response body.
    ///
    /// # Errors
    ///
    /// Backend status errors (including 404) and transport errors.
    #[instrument(level = "debug", skip(self), fields(range = ?range))]
    pub async fn get_object(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Body, TransferError> {
        let response = self
            .send(ObjectRequest::new(Operation::GetObject { range }, key))
            .await?;
        Ok(response.body)
    }

    /// Issues PutObject and returns the ETag, if any.
    ///
    /// # Errors
    ///
    /// Backend status errors and transport errors.
    #[instrument(level = "debug", skip(self, body), fields(length = body.len()))]
    pub async fn put_object(
        &self,
        key: &str,
        body: Body,
        storage_class: Option<&str>,
    ) -> Result<Option<String>, TransferError> {
        let operation = Operation::PutObject {
            storage_class: storage_class.map(str::to_string),
        };
        let name = operation.name();
        let length = body.len();
        let started = Instant::now();
        let response = self
            .send(ObjectRequest::new(operation, key).with_body(body))
            .await?;
        self.slow_log
            .check_transfer(name, key, length, started.elapsed());
        Ok(response.header(ETAG.as_str()).map(unquote_etag))
    }

    /// Issues InitiateMultipartUpload and returns the upload id.
    ///
    /// # Errors
    ///
    /// Backend status errors, transport errors, or a protocol error when the
    /// response carries no `<UploadId>`.
    #[instrument(level = "debug", skip(self))]
    pub async fn initiate_multipart_upload(
        &self,
        key: &str,
        storage_class: Option<&str>,
    ) -> Result<String, TransferError> {
        let operation = Operation::InitiateMultipartUpload {
            storage_class: storage_class.map(str::to_string),
        };
        let name = operation.name();
        let response = self.send(ObjectRequest::new(operation, key)).await?;
        let body = response.body.collect().await?;
        let text = String::from_utf8_lossy(&body);
        let upload_id = parse_upload_id(&text)
            .ok_or_else(|| TransferError::protocol(name, key, "missing UploadId element"))?;
        debug!(%upload_id, "multipart upload initiated");
        Ok(upload_id)
    }

    /// Issues UploadPart and returns the part's ETag.
    ///
    /// # Errors
    ///
    /// Backend status errors, transport errors, or a protocol error when the
    /// response carries no ETag.
    #[instrument(level = "debug", skip(self, body), fields(length = body.len()))]
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Body,
    ) -> Result<PartResult, TransferError> {
        let operation = Operation::UploadPart {
            upload_id: upload_id.to_string(),
            part_number,
        };
        let name = operation.name();
        let length = body.len();
        let started = Instant::now();
        let response = self
            .send(ObjectRequest::new(operation, key).with_body(body))
            .await?;
        self.slow_log
            .check_transfer(name, key, length, started.elapsed());
        let etag = response
            .header(ETAG.as_str())
            .map(unquote_etag)
            .ok_or_else(|| {
                TransferError::protocol(name, key, format!("part {part_number} returned no ETag"))
            })?;
        Ok(PartResult { part_number, etag })
    }

    /// Issues CompleteMultipartUpload with `parts` in the given order.
    ///
    /// # Errors
    ///
    /// Backend status errors and transport errors.
    #[instrument(level = "debug", skip(self, parts), fields(parts = parts.len()))]
    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartResult>,
    ) -> Result<Option<String>, TransferError> {
        debug_assert!(parts.windows(2).all(|w| w[0].part_number < w[1].part_number));
        let operation = Operation::CompleteMultipartUpload {
            upload_id: upload_id.to_string(),
            parts,
        };
        let name = operation.name();
        let started = Instant::now();
        let response = self.send(ObjectRequest::new(operation, key)).await?;
        self.slow_log.check_call(name, key, started.elapsed());
        Ok(response.header(ETAG.as_str()).map(unquote_etag))
    }

    /// Issues AbortMultipartUpload. An unknown upload id (404) counts as
    /// already aborted.
    ///
    /// # Errors
    ///
    /// Any non-404 failure.
    #[instrument(level = "debug", skip(self))]
    pub async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), TransferError> {
        let operation = Operation::AbortMultipartUpload {
            upload_id: upload_id.to_string(),
        };
        match self.send(ObjectRequest::new(operation, key)).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => {
                debug!(%upload_id, "upload already gone");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Issues CopyObject from `source_key` to `key`.
    ///
    /// # Errors
    ///
    /// Backend status errors and transport errors.
    #[instrument(level = "debug", skip(self))]
    pub async fn copy_object(
        &self,
        source_key: &str,
        key: &str,
    ) -> Result<Option<String>, TransferError> {
        let operation = Operation::CopyObject {
            source_key: source_key.to_string(),
        };
        let response = self.send(ObjectRequest::new(operation, key)).await?;
        Ok(response.header(ETAG.as_str()).map(unquote_etag))
    }

    /// Issues DeleteObject. Deleting a missing object succeeds.
    ///
    /// # Errors
    ///
    /// Any non-404 failure.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_object(&self, key: &str) -> Result<(), TransferError> {
        match self
            .send(ObjectRequest::new(Operation::DeleteObject, key))
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn send(&self, request: ObjectRequest) -> Result<ObjectResponse, TransferError> {
        let name = request.operation.name();
        let key = request.key.clone();
        let response = self.executor.execute(request).await?;
        if response.is_success() {
            return Ok(response);
        }

        let retry_after = response.header(RETRY_AFTER.as_str()).map(str::to_string);
        debug!(operation = name, %key, status = response.status, "backend returned error status");
        Err(TransferError::backend_with_retry_after(
            name,
            key,
            response.status,
            retry_after,
        ))
    }
}

/// Extracts the `<UploadId>` element from an InitiateMultipartUpload body.
#[must_use]
pub fn parse_upload_id(body: &str) -> Option<String> {
    const OPEN: &str = "<UploadId>";
    const CLOSE: &str = "</UploadId>";

    let start = body.find(OPEN)? + OPEN.len();
    let end = start + body[start..].find(CLOSE)?;
    let upload_id = body[start..end].trim();
    (!upload_id.is_empty()).then(|| upload_id.to_string())
}

fn unquote_etag(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}
