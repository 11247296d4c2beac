//! Worker pool: a fixed number of workers draining one shared work queue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// FIFO of work units, filled up front and only drained afterwards.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> WorkQueue<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take every unit nobody picked up.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }
}

/// Worker pool handle.
/// - `request_stop` stops workers from taking new units, in-flight units
///   keep running
/// - `join` waits for every worker to exit
/// - `stop` does both, aborting whatever outlives the grace period
pub struct WorkerPool {
    stop_tx: watch::Sender<bool>,
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `n` workers that run `handler` on units from `queue` until it is
    /// empty or a stop is requested.
    pub fn spawn<T, H, Fut>(n: usize, queue: Arc<WorkQueue<T>>, handler: H) -> Self
    where
        T: Send + 'static,
        H: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handler = Arc::new(handler);

        let mut workers = JoinSet::new();
        for worker_id in 0..n {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let stop_rx = stop_rx.clone();
            workers.spawn(worker_loop(worker_id, queue, handler, stop_rx));
        }

        Self { stop_tx, workers }
    }

    pub fn request_stop(&self) {
        // ignore send error: workers may already be gone
        let _ = self.stop_tx.send(true);
    }

    /// Wait for all workers. Cancel-safe, so it can sit in a `select!`.
    pub async fn join(&mut self) {
        while let Some(result) = self.workers.join_next().await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_panic() => error!(error = %e, "worker panicked"),
                Err(_) => {}
            }
        }
    }

    /// Request a stop, wait up to `grace` for in-flight units, then abort the
    /// rest. Returns `true` if anything had to be aborted.
    pub async fn stop(&mut self, grace: Duration) -> bool {
        self.request_stop();
        if tokio::time::timeout(grace, self.join()).await.is_ok() {
            return false;
        }
        self.workers.abort_all();
        self.join().await;
        true
    }
}

async fn worker_loop<T, H, Fut>(
    worker_id: usize,
    queue: Arc<WorkQueue<T>>,
    handler: Arc<H>,
    stop_rx: watch::Receiver<bool>,
) where
    H: Fn(usize, T) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let Some(unit) = queue.pop() else {
            break;
        };
        handler(worker_id, unit).await;
    }
    debug!(worker_id, "worker exited");
}
