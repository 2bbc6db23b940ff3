//! Bounded part execution shared by uploads and migrations.
//!
//! Every part of a session is spawned at once onto a [`JoinSet`]; the
//! [`UploadPool`] semaphore bounds how many run concurrently across all
//! sessions of a client. The first part failure dooms the session, aborts
//! every sibling task and is returned once the set has drained.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use super::partition::PartDescriptor;
use super::session::UploadSession;
use crate::storage::{PartResult, RetryPolicy, TransferError, run_with_retry};

/// Client-wide bound on concurrent part transfers.
#[derive(Debug, Clone)]
pub struct UploadPool {
    semaphore: Arc<Semaphore>,
    workers: usize,
}

impl UploadPool {
    /// Creates a pool allowing `workers` concurrent parts (at least 1).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Configured concurrency.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Permits not currently held by a running part.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Runs every part of `session` through `transfer_part`, retrying each
    /// with `retry`, and returns the results in completion order.
    ///
    /// `transfer_part` receives the part and the 1-based attempt number and
    /// must rebuild its request body from scratch on every call.
    ///
    /// # Errors
    ///
    /// The first part failure. The session is marked aborted before this
    /// returns; issuing the remote abort is left to the caller.
    #[instrument(level = "debug", skip_all, fields(key = %session.key(), parts = parts.len()))]
    pub async fn run_parts<F, Fut>(
        &self,
        session: &Arc<UploadSession>,
        parts: Vec<PartDescriptor>,
        retry: &RetryPolicy,
        transfer_part: F,
    ) -> Result<Vec<PartResult>, TransferError>
    where
        F: Fn(PartDescriptor, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PartResult, TransferError>> + Send + 'static,
    {
        session.begin_parts();
        let transfer_part = Arc::new(transfer_part);
        let mut tasks = JoinSet::new();

        for part in parts {
            let semaphore = Arc::clone(&self.semaphore);
            let session = Arc::clone(session);
            let transfer_part = Arc::clone(&transfer_part);
            let retry = retry.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| TransferError::session_aborted(session.key()))?;
                let label = format!("part {} of {}", part.number, session.key());

                run_with_retry(&retry, &label, |attempt| {
                    let doomed = session.is_aborted();
                    let key = session.key().to_string();
                    let transfer = transfer_part(part, attempt);
                    async move {
                        if doomed {
                            return Err(TransferError::session_aborted(key));
                        }
                        transfer.await
                    }
                })
                .await
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        let mut failure: Option<TransferError> = None;

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_error) if join_error.is_cancelled() => continue,
                Err(join_error) => {
                    warn!(error = %join_error, "part task panicked");
                    Err(TransferError::protocol(
                        "UploadPart",
                        session.key(),
                        "part task panicked",
                    ))
                }
            };

            match outcome {
                Ok(result) => {
                    debug!(part_number = result.part_number, "part done");
                    results.push(result);
                }
                Err(error) => {
                    if session.mark_aborted() {
                        debug!(error = %error, "part failed, cancelling siblings");
                        tasks.abort_all();
                    }
                    // Sibling SessionAborted errors are fallout, keep the first real cause.
                    let replace = match &failure {
                        None => true,
                        Some(TransferError::SessionAborted { .. }) => {
                            !matches!(error, TransferError::SessionAborted { .. })
                        }
                        Some(_) => false,
                    };
                    if replace {
                        failure = Some(error);
                    }
                }
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(results),
        }
    }
}
