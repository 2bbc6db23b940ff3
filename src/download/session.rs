//! Per-download scratch state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Scratch directory and bookkeeping for one chunked download.
///
/// The directory may only be removed once the session is closed and no part
/// task is writing into it.
#[derive(Debug)]
pub struct DownloadSession {
    id: String,
    root: PathBuf,
    start_virtual: u64,
    started: Instant,
    active: AtomicUsize,
    closed: AtomicBool,
}

impl DownloadSession {
    /// Creates a session under `scratch_dir` starting at pool time
    /// `start_virtual`.
    #[must_use]
    pub fn new(scratch_dir: &Path, start_virtual: u64) -> Arc<Self> {
        let id = format!("{:016x}", rand::random::<u64>());
        Arc::new(Self {
            root: scratch_dir.join(&id),
            id,
            start_virtual,
            started: Instant::now(),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Random session id, also the directory name.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session scratch directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pool virtual time when the session started.
    #[must_use]
    pub fn start_virtual(&self) -> u64 {
        self.start_virtual
    }

    /// Wall time since the session started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Part tasks currently touching the scratch directory.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns true once the consumer closed the download.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the session closed; returns true for the first caller.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Counts the caller as active until the guard drops.
    #[must_use]
    pub fn enter(self: &Arc<Self>) -> ActiveTaskGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveTaskGuard {
            session: Arc::clone(self),
        }
    }

    /// Enters unless the session is closed.
    ///
    /// The counter is raised before the closed flag is read, so either the
    /// closer sees this task as active or this task sees the session closed.
    #[must_use]
    pub fn try_enter(self: &Arc<Self>) -> Option<ActiveTaskGuard> {
        let guard = self.enter();
        (!self.is_closed()).then_some(guard)
    }

    /// Part file for one attempt of part `seq`.
    #[must_use]
    pub fn part_path(&self, seq: usize, priority: u64, attempt: u32) -> PathBuf {
        self.root
            .join(format!("downloading_{seq}_{priority}_{attempt}.temp"))
    }
}

/// Keeps a session's active counter raised.
#[derive(Debug)]
pub struct ActiveTaskGuard {
    session: Arc<DownloadSession>,
}

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        self.session.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_active_tasks() {
        let session = DownloadSession::new(Path::new("/tmp/scratch"), 0);
        let first = session.enter();
        let second = session.enter();
        assert_eq!(session.active(), 2);
        drop(first);
        assert_eq!(session.active(), 1);
        drop(second);
        assert_eq!(session.active(), 0);
    }

    #[test]
    fn test_close_reports_first_caller() {
        let session = DownloadSession::new(Path::new("/tmp/scratch"), 0);
        assert!(!session.is_closed());
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
    }

    #[test]
    fn test_try_enter_refuses_closed_session() {
        let session = DownloadSession::new(Path::new("/tmp/scratch"), 0);
        let open = session.try_enter();
        assert!(open.is_some());
        assert_eq!(session.active(), 1);

        session.close();
        assert!(session.try_enter().is_none());
        assert_eq!(session.active(), 1);
        drop(open);
        assert_eq!(session.active(), 0);
    }

    #[test]
    fn test_part_path_layout() {
        let session = DownloadSession::new(Path::new("/tmp/scratch"), 120);
        let path = session.part_path(3, 150, 2);
        assert_eq!(path.parent().unwrap(), session.root());
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "downloading_3_150_2.temp"
        );
        assert!(session.root().ends_with(session.id()));
    }
}
