//! Deferred removal of chunked-download scratch directories.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use super::session::DownloadSession;

/// Removes session directories once no part task is using them.
///
/// Cheap to clone; clones share the pending counter.
#[derive(Debug, Clone)]
pub struct TempResourceJanitor {
    runtime: Option<Handle>,
    delay: Duration,
    max_attempts: u32,
    pending: Arc<AtomicUsize>,
}

impl TempResourceJanitor {
    /// Creates a janitor bound to the current Tokio runtime, if any.
    ///
    /// `delay` is the re-check interval while tasks are still active and the
    /// back-off between failed removals; `max_attempts` bounds removals.
    #[must_use]
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            runtime: Handle::try_current().ok(),
            delay,
            max_attempts: max_attempts.max(1),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cleanups scheduled but not finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Schedules removal of `session`'s directory.
    pub fn schedule(&self, session: Arc<DownloadSession>) {
        let Some(runtime) = &self.runtime else {
            if session.active() == 0 {
                remove_now(&session);
            } else {
                warn!(
                    session = session.id(),
                    root = %session.root().display(),
                    "no runtime to defer cleanup, scratch directory left behind"
                );
            }
            return;
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        let pending = Arc::clone(&self.pending);
        let delay = self.delay;
        let max_attempts = self.max_attempts;
        runtime.spawn(async move {
            cleanup_session(&session, delay, max_attempts).await;
            pending.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Waits until every scheduled cleanup has finished.
    pub async fn wait_idle(&self) {
        while self.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[instrument(level = "debug", skip_all, fields(session = session.id()))]
async fn cleanup_session(session: &DownloadSession, delay: Duration, max_attempts: u32) {
    let root = session.root();
    let mut failures = 0u32;

    loop {
        let active = session.active();
        if active > 0 {
            debug!(active, "parts still active, deferring cleanup");
            tokio::time::sleep(delay).await;
            continue;
        }

        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => {
                debug!(root = %root.display(), "scratch directory removed");
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                failures += 1;
                if failures >= max_attempts {
                    warn!(
                        root = %root.display(),
                        attempts = failures,
                        error = %e,
                        "giving up on scratch directory"
                    );
                    return;
                }
                warn!(root = %root.display(), attempt = failures, error = %e, "scratch cleanup failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn remove_now(session: &DownloadSession) {
    match std::fs::remove_dir_all(session.root()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(root = %session.root().display(), error = %e, "scratch cleanup failed"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_removes_idle_session_directory() {
        let scratch = tempfile::tempdir().unwrap();
        let session = DownloadSession::new(scratch.path(), 0);
        std::fs::create_dir_all(session.root()).unwrap();
        std::fs::write(session.root().join("downloading_0_0_1.temp"), b"x").unwrap();

        let janitor = TempResourceJanitor::new(Duration::from_millis(5), 3);
        janitor.schedule(Arc::clone(&session));
        janitor.wait_idle().await;

        assert!(!session.root().exists());
        assert_eq!(janitor.pending(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_active_tasks() {
        let scratch = tempfile::tempdir().unwrap();
        let session = DownloadSession::new(scratch.path(), 0);
        std::fs::create_dir_all(session.root()).unwrap();
        let guard = session.enter();

        let janitor = TempResourceJanitor::new(Duration::from_millis(5), 3);
        janitor.schedule(Arc::clone(&session));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(session.root().exists());
        assert_eq!(janitor.pending(), 1);

        drop(guard);
        janitor.wait_idle().await;
        assert!(!session.root().exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_fine() {
        let scratch = tempfile::tempdir().unwrap();
        let session = DownloadSession::new(scratch.path(), 0);
        let janitor = TempResourceJanitor::new(Duration::from_millis(5), 3);
        janitor.schedule(session);
        janitor.wait_idle().await;
    }

    #[test]
    fn test_without_runtime_removes_immediately() {
        let scratch = tempfile::tempdir().unwrap();
        let session = DownloadSession::new(scratch.path(), 0);
        std::fs::create_dir_all(session.root()).unwrap();

        let janitor = TempResourceJanitor::new(Duration::from_millis(5), 3);
        janitor.schedule(Arc::clone(&session));
        assert!(!session.root().exists());
    }
}
