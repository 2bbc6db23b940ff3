//! Remote multipart-upload session lifecycle.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument, warn};

use crate::storage::{PartResult, RetryPolicy, StoreClient, TransferError, run_with_retry};

/// Lifecycle of a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Upload id obtained, no part sent yet.
    Initiated,
    /// Parts are being uploaded.
    PartsInFlight,
    /// CompleteMultipartUpload issued.
    Completing,
    /// Object committed.
    Completed,
    /// AbortMultipartUpload issued.
    Aborting,
    /// Session discarded.
    Aborted,
}

impl UploadState {
    /// Returns true once no further remote call may be made for the session.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborting | Self::Aborted)
    }
}

/// One remote multipart upload.
///
/// Every session ends remotely in exactly one Complete or one Abort. The
/// `aborted` flag is read by in-flight part tasks so they stop issuing
/// requests once a sibling has failed. Initiate, Complete and Abort are
/// retried with the session's [`RetryPolicy`].
#[derive(Debug)]
pub struct UploadSession {
    store: StoreClient,
    retry: RetryPolicy,
    key: String,
    upload_id: String,
    state: Mutex<UploadState>,
    aborted: AtomicBool,
}

impl UploadSession {
    /// Issues InitiateMultipartUpload and wraps the returned upload id.
    ///
    /// # Errors
    ///
    /// Propagates the initiate failure once retries are exhausted; no
    /// session exists in that case.
    #[instrument(level = "debug", skip(store, retry))]
    pub async fn initiate(
        store: StoreClient,
        key: &str,
        storage_class: Option<&str>,
        retry: &RetryPolicy,
    ) -> Result<Self, TransferError> {
        let label = format!("initiate {key}");
        let upload_id = run_with_retry(retry, &label, |_| {
            store.initiate_multipart_upload(key, storage_class)
        })
        .await?;
        info!(%key, %upload_id, "multipart session opened");
        Ok(Self::resume(store, key, upload_id, retry.clone()))
    }

    /// Wraps an existing upload id.
    #[must_use]
    pub fn resume(store: StoreClient, key: &str, upload_id: String, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            key: key.to_string(),
            upload_id,
            state: Mutex::new(UploadState::Initiated),
            aborted: AtomicBool::new(false),
        }
    }

    /// Object key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Backend upload id.
    #[must_use]
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> UploadState {
        *self.lock_state()
    }

    /// Returns true once a failure has doomed the session.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Marks the session doomed without calling the backend yet.
    ///
    /// Returns true for the first caller.
    pub fn mark_aborted(&self) -> bool {
        !self.aborted.swap(true, Ordering::AcqRel)
    }

    /// Moves from `Initiated` to `PartsInFlight`.
    pub fn begin_parts(&self) {
        let mut state = self.lock_state();
        if *state == UploadState::Initiated {
            *state = UploadState::PartsInFlight;
        }
    }

    /// Uploads one part through the session's store.
    ///
    /// # Errors
    ///
    /// [`TransferError::SessionAborted`] once the session is doomed, otherwise
    /// the backend failure.
    pub async fn upload_part(
        &self,
        part_number: u32,
        body: crate::storage::Body,
    ) -> Result<PartResult, TransferError> {
        if self.is_aborted() {
            return Err(TransferError::session_aborted(&self.key));
        }
        self.store
            .upload_part(&self.key, &self.upload_id, part_number, body)
            .await
    }

    /// Commits the session with `parts` sorted by part number.
    ///
    /// # Errors
    ///
    /// Returns the Complete failure once retries are exhausted; the caller is
    /// expected to abort.
    #[instrument(level = "debug", skip(self, parts), fields(key = %self.key, upload_id = %self.upload_id))]
    pub async fn complete(
        &self,
        mut parts: Vec<PartResult>,
    ) -> Result<Option<String>, TransferError> {
        if self.is_aborted() {
            return Err(TransferError::session_aborted(&self.key));
        }
        parts.sort_by_key(|part| part.part_number);
        let count = parts.len();
        self.set_state(UploadState::Completing);

        let label = format!("complete {}", self.key);
        let etag = run_with_retry(&self.retry, &label, |_| {
            self.store
                .complete_multipart_upload(&self.key, &self.upload_id, parts.clone())
        })
        .await?;
        self.set_state(UploadState::Completed);
        info!(key = %self.key, upload_id = %self.upload_id, parts = count, "multipart session completed");
        Ok(etag)
    }

    /// Completes the session when every part succeeded, otherwise aborts it
    /// and hands back the part error. A failed Complete is aborted too.
    ///
    /// # Errors
    ///
    /// The part error or the Complete failure, after the abort.
    pub async fn conclude(
        &self,
        parts: Result<Vec<PartResult>, TransferError>,
    ) -> Result<Option<String>, TransferError> {
        let error = match parts {
            Ok(parts) => match self.complete(parts).await {
                Ok(etag) => return Ok(etag),
                Err(error) => error,
            },
            Err(error) => error,
        };

        warn!(
            key = %self.key,
            upload_id = %self.upload_id,
            error = %error,
            "multipart upload failed, aborting session"
        );
        self.abort().await;
        Err(error)
    }

    /// Discards the session remotely. Never fails: backend errors are logged.
    ///
    /// Calling it on a completed or already aborting session does nothing.
    #[instrument(level = "debug", skip(self), fields(key = %self.key, upload_id = %self.upload_id))]
    pub async fn abort(&self) {
        {
            let mut state = self.lock_state();
            if state.is_terminal() {
                debug!(state = ?*state, "abort on finished session ignored");
                return;
            }
            *state = UploadState::Aborting;
        }
        self.mark_aborted();

        let label = format!("abort {}", self.key);
        match run_with_retry(&self.retry, &label, |_| {
            self.store.abort_multipart_upload(&self.key, &self.upload_id)
        })
        .await
        {
            Ok(()) => info!("multipart session aborted"),
            Err(error) => warn!(error = %error, "abort failed, upload may linger on the backend"),
        }
        self.set_state(UploadState::Aborted);
    }

    fn set_state(&self, next: UploadState) {
        *self.lock_state() = next;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, UploadState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
