//! Client facade tying the transfer components together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use crate::config::{ClientConfig, ConfigError};
use crate::download::{
    ChunkedDownloadEngine, DownloadHealthWatchdog, DownloadSettings, ObjectBody, PriorityPool,
    TempResourceJanitor, WatchdogSnapshot,
};
use crate::storage::{
    ByteRange, DEFAULT_MAX_DELAY, HttpExecutor, ObjectMetadata, RateLimiter, RequestExecutor,
    RetryPolicy, StoreClient, TransferError,
};
use crate::transfer::{
    MigrationCoordinator, MigrationOutcome, UploadCoordinator, UploadOutcome, UploadPool,
};

/// Errors raised while building a client.
#[derive(Debug, Error)]
pub enum ClientBuildError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The bundled HTTP executor could not be created.
    #[error(transparent)]
    Executor(#[from] TransferError),
}

/// Object-storage client with multipart upload, chunked download and
/// migration.
///
/// Each client owns one upload pool, one optional priority download pool,
/// one rate limiter, one watchdog and one janitor; none of them are shared
/// with other clients.
#[derive(Debug)]
pub struct ObjectStoreClient {
    config: ClientConfig,
    store: StoreClient,
    uploads: UploadCoordinator,
    downloads: ChunkedDownloadEngine,
    migrations: MigrationCoordinator,
}

impl ObjectStoreClient {
    /// Builds a client over `executor`.
    ///
    /// Chunked downloads need `download_workers > 0` and a Tokio runtime at
    /// construction time; without a runtime they stay disabled.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `config` fails validation.
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        config: ClientConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let store = StoreClient::with_checksum_header(executor, config.checksum_header.as_str())
            .with_slow_log(config.slow_log());
        let retry = RetryPolicy::new(
            config.part_retry_attempts,
            config.retry_base_delay(),
            DEFAULT_MAX_DELAY,
        );
        let upload_pool = UploadPool::new(config.upload_workers);

        let uploads = UploadCoordinator::new(
            store.clone(),
            upload_pool.clone(),
            retry.clone(),
            config.multipart_threshold,
            config.upload_limits(),
        );
        let migrations = MigrationCoordinator::new(
            store.clone(),
            upload_pool,
            retry.clone(),
            config.upload_limits(),
        );
        let downloads = ChunkedDownloadEngine::new(
            store.clone(),
            download_pool(config.download_workers),
            Arc::new(RateLimiter::new(config.download_qps)),
            Arc::new(DownloadHealthWatchdog::new(
                config.watchdog_high_water(),
                config.watchdog_low_water(),
                config.watchdog_half_life(),
            )),
            TempResourceJanitor::new(config.cleanup_delay(), config.cleanup_max_attempts),
            retry,
            DownloadSettings::from(&config),
        );

        Ok(Self {
            config,
            store,
            uploads,
            downloads,
            migrations,
        })
    }

    /// Builds a client over the bundled HTTP executor.
    ///
    /// # Errors
    ///
    /// Invalid configuration or an unusable endpoint.
    pub fn connect(endpoint: &str, config: ClientConfig) -> Result<Self, ClientBuildError> {
        let executor = HttpExecutor::with_options(
            endpoint,
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.read_timeout_secs),
            HeaderMap::new(),
        )?;
        Ok(Self::new(Arc::new(executor), config)?)
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Typed backend operations.
    #[must_use]
    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    /// Uploads a local file.
    ///
    /// # Errors
    ///
    /// [`TransferError::InvalidRequest`] if the file does not exist; otherwise
    /// the first part failure after the upload has been aborted.
    pub async fn put_file(
        &self,
        key: &str,
        path: &Path,
        storage_class: Option<&str>,
    ) -> Result<UploadOutcome, TransferError> {
        self.uploads.put_file(key, path, storage_class).await
    }

    /// Uploads an in-memory buffer.
    ///
    /// # Errors
    ///
    /// See [`ObjectStoreClient::put_file`].
    pub async fn put_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        storage_class: Option<&str>,
    ) -> Result<UploadOutcome, TransferError> {
        self.uploads.put_bytes(key, bytes, storage_class).await
    }

    /// Uploads exactly `length` bytes read from `reader`.
    ///
    /// # Errors
    ///
    /// [`TransferError::InvalidRequest`] if the reader ends early; otherwise
    /// as [`ObjectStoreClient::put_file`].
    pub async fn put_stream<R>(
        &self,
        key: &str,
        reader: R,
        length: u64,
        storage_class: Option<&str>,
    ) -> Result<UploadOutcome, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.uploads
            .put_stream(key, reader, length, storage_class)
            .await
    }

    /// Reads `key`, or the inclusive `range` of it. `Ok(None)` when missing.
    ///
    /// # Errors
    ///
    /// Failure of the request that serves the body.
    pub async fn get_object(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<ObjectBody>, TransferError> {
        self.downloads.get_object(key, range).await
    }

    /// Fetches object metadata.
    ///
    /// # Errors
    ///
    /// Backend or transport failures, including not-found.
    pub async fn head_object(&self, key: &str) -> Result<ObjectMetadata, TransferError> {
        self.store.head_object(key).await
    }

    /// Returns whether `key` exists.
    ///
    /// # Errors
    ///
    /// Backend failures other than not-found.
    pub async fn check_object_exist(&self, key: &str) -> Result<bool, TransferError> {
        self.store.check_object_exist(key).await
    }

    /// Deletes `key`; a missing object is not an error.
    ///
    /// # Errors
    ///
    /// Backend or transport failures.
    pub async fn delete_object(&self, key: &str) -> Result<(), TransferError> {
        self.store.delete_object(key).await
    }

    /// Server-side copy within this store.
    ///
    /// # Errors
    ///
    /// Backend or transport failures.
    pub async fn copy_object(
        &self,
        source_key: &str,
        key: &str,
    ) -> Result<Option<String>, TransferError> {
        self.store.copy_object(source_key, key).await
    }

    /// Copies `source_key` from `source` into `destination_key` here,
    /// verifying length and checksum afterwards.
    ///
    /// # Errors
    ///
    /// [`TransferError::Integrity`] after deleting a mismatched destination,
    /// otherwise the first transfer failure.
    #[instrument(skip(self, source))]
    pub async fn migrate_from(
        &self,
        source: &StoreClient,
        source_key: &str,
        destination_key: &str,
        storage_class: Option<&str>,
    ) -> Result<MigrationOutcome, TransferError> {
        self.migrations
            .migrate(source, source_key, destination_key, storage_class)
            .await
    }

    /// Chunked-download health.
    #[must_use]
    pub fn health(&self) -> WatchdogSnapshot {
        self.downloads.health()
    }

    /// Waits for scheduled scratch cleanups to finish.
    pub async fn wait_for_cleanup(&self) {
        self.downloads.janitor().wait_idle().await;
    }
}

fn download_pool(workers: usize) -> Option<PriorityPool> {
    if workers == 0 {
        return None;
    }
    match Handle::try_current() {
        Ok(runtime) => {
            debug!(workers, "starting download pool");
            Some(PriorityPool::spawn(&runtime, workers))
        }
        Err(_) => {
            warn!(workers, "no Tokio runtime, chunked downloads disabled");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::storage::{Body, ObjectRequest, ObjectResponse};

    struct NotFound;

    #[async_trait]
    impl RequestExecutor for NotFound {
        async fn execute(&self, _request: ObjectRequest) -> Result<ObjectResponse, TransferError> {
            Ok(ObjectResponse {
                status: 404,
                headers: HeaderMap::new(),
                body: Body::Empty,
            })
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ClientConfig {
            upload_workers: 0,
            ..ClientConfig::default()
        };
        assert!(ObjectStoreClient::new(Arc::new(NotFound), config).is_err());
    }

    #[test]
    fn test_without_runtime_chunked_downloads_are_off() {
        let config = ClientConfig {
            download_workers: 4,
            ..ClientConfig::default()
        };
        let client = ObjectStoreClient::new(Arc::new(NotFound), config).unwrap();
        assert_eq!(client.health().queued_parts, 0);
        assert!(client.health().healthy);
    }

    #[tokio::test]
    async fn test_missing_object_reads_as_none() {
        let config = ClientConfig {
            download_workers: 2,
            download_multipart_threshold: 4,
            ..ClientConfig::default()
        };
        let client = ObjectStoreClient::new(Arc::new(NotFound), config).unwrap();
        assert!(client.get_object("k", None).await.unwrap().is_none());
        assert!(
            client
                .get_object("k", Some(ByteRange::new(0, 99)))
                .await
                .unwrap()
                .is_none()
        );
        assert!(!client.check_object_exist("k").await.unwrap());
    }

    #[test]
    fn test_connect_rejects_bad_endpoint() {
        let result = ObjectStoreClient::connect("not a url", ClientConfig::default());
        assert!(matches!(result, Err(ClientBuildError::Executor(_))));
    }
}
