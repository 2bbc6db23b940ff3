//! Fixed-size worker pool with a priority ready queue.
//!
//! Jobs carry a virtual-time priority (milliseconds since the pool epoch);
//! workers always start the queued job with the lowest priority, FIFO among
//! equal priorities. Every submission returns a [`PoolHandle`]; dropping the
//! handle cancels the job, either before it starts or at its next await
//! point.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueuedJob {
    priority: u64,
    order: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Reversed: BinaryHeap is a max-heap, the smallest key must pop first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<QueuedJob>>,
    notify: Notify,
    shutdown: AtomicBool,
    next_order: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BinaryHeap<QueuedJob>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Priority-scheduled download workers, owned by one client.
pub struct PriorityPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    epoch: Instant,
}

impl std::fmt::Debug for PriorityPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityPool")
            .field("workers", &self.workers.len())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl PriorityPool {
    /// Spawns `workers` long-lived worker tasks (at least 1) on `runtime`.
    #[must_use]
    pub fn spawn(runtime: &Handle, workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            next_order: AtomicU64::new(0),
        });

        let workers = (0..workers.max(1))
            .map(|index| runtime.spawn(worker_loop(index, Arc::clone(&shared))))
            .collect::<Vec<_>>();
        debug!(workers = workers.len(), "priority pool started");

        Self {
            shared,
            workers,
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the pool was created.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn virtual_now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Number of worker tasks.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Jobs waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.lock().len()
    }

    /// Queues `future` at `priority` and returns a handle to its output.
    pub fn submit<F, T>(&self, priority: u64, future: F) -> PoolHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (mut tx, rx) = oneshot::channel();
        let job = async move {
            if tx.is_closed() {
                trace!(priority, "skipping cancelled job");
                return;
            }
            tokio::select! {
                biased;
                () = tx.closed() => trace!(priority, "job cancelled while running"),
                output = future => {
                    let _ = tx.send(output);
                }
            }
        };

        let order = self.shared.next_order.fetch_add(1, Ordering::Relaxed);
        self.shared.lock().push(QueuedJob {
            priority,
            order,
            job: Box::pin(job),
        });
        self.shared.notify.notify_one();
        PoolHandle { rx }
    }
}

impl Drop for PriorityPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker_loop(index: usize, shared: Arc<Shared>) {
    loop {
        let next = shared.lock().pop();
        match next {
            Some(queued) => {
                trace!(worker = index, priority = queued.priority, "starting job");
                queued.job.await;
            }
            None => {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.notify.notified().await;
            }
        }
    }
}

/// Output of a pooled job. Dropping it cancels the job.
///
/// Resolves to `None` if the pool shut down before the job finished.
#[derive(Debug)]
pub struct PoolHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for PoolHandle<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn pool(workers: usize) -> PriorityPool {
        PriorityPool::spawn(&Handle::current(), workers)
    }

    #[tokio::test]
    async fn test_submit_returns_output() {
        let pool = pool(2);
        assert_eq!(pool.submit(0, async { 41 + 1 }).await, Some(42));
    }

    #[tokio::test]
    async fn test_lowest_priority_runs_first() {
        let pool = pool(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the only worker so the rest queue up.
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = pool.submit(0, async move {
            let _ = release_rx.await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut handles = Vec::new();
        for priority in [30u64, 10, 20, 10] {
            let order = Arc::clone(&order);
            handles.push(pool.submit(priority, async move {
                order.lock().unwrap().push(priority);
            }));
        }
        assert_eq!(pool.queued(), 4);

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![10, 10, 20, 30]);
    }

    #[tokio::test]
    async fn test_dropped_handle_never_starts() {
        let pool = pool(1);
        let started = Arc::new(AtomicUsize::new(0));

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = pool.submit(0, async move {
            let _ = release_rx.await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let counter = Arc::clone(&started);
        let cancelled = pool.submit(1, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(cancelled);

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        assert_eq!(pool.submit(2, async {}).await, Some(()));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_running_job() {
        let pool = pool(1);
        let finished = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        let running = pool.submit(0, async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(running);

        // The worker is free again long before the sleeping job would finish.
        let next = tokio::time::timeout(Duration::from_millis(100), pool.submit(1, async { 7 }))
            .await
            .unwrap();
        assert_eq!(next, Some(7));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_virtual_now_advances() {
        let pool = pool(1);
        let before = pool.virtual_now();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(pool.virtual_now() >= before + 10);
    }
}
