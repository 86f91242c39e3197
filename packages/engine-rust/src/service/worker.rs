//! Worker pool draining a shared task queue.
//!
//! `WorkerPool<R>` runs N tokio tasks, each owning a `BackgroundRunnable`
//! and pulling tasks from one bounded mpsc receiver. Consumers such as
//! `seda:` use it to process queued exchanges concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by each worker of a [`WorkerPool`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

pub struct WorkerPool<R: BackgroundRunnable> {
    receiver: SharedReceiver<R::Task>,
    shutdown_txs: Vec<oneshot::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> WorkerPool<R> {
    /// Spawns `workers` tasks draining `receiver`. `make_runnable` is called
    /// once per worker with its index.
    pub fn spawn<F>(
        receiver: mpsc::Receiver<R::Task>,
        workers: usize,
        tick_interval: Duration,
        mut make_runnable: F,
    ) -> Self
    where
        F: FnMut(usize) -> R,
    {
        let receiver = Arc::new(Mutex::new(receiver));
        let mut shutdown_txs = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers.max(1) {
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let runnable = make_runnable(index);
            handles.push(tokio::spawn(run_worker(
                index,
                runnable,
                Arc::clone(&receiver),
                tick_interval,
                shutdown_rx,
            )));
            shutdown_txs.push(shutdown_tx);
        }

        Self {
            receiver,
            shutdown_txs,
            handles,
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops every worker and waits for them to finish. Returns the receiver
    /// so the queue can be drained by a later pool.
    pub async fn stop(mut self) -> Option<mpsc::Receiver<R::Task>> {
        for tx in self.shutdown_txs.drain(..) {
            let _ = tx.send(());
        }
        for result in join_all(self.handles.drain(..)).await {
            if let Err(e) = result {
                warn!(error = %e, "worker task terminated abnormally");
            }
        }
        Arc::try_unwrap(self.receiver)
            .ok()
            .map(Mutex::into_inner)
    }
}

async fn run_worker<R: BackgroundRunnable>(
    index: usize,
    mut runnable: R,
    receiver: SharedReceiver<R::Task>,
    tick_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut tick = tokio::time::interval(tick_interval);
    // Skip the first immediate tick so on_tick doesn't fire at startup.
    tick.tick().await;

    loop {
        tokio::select! {
            task = async { receiver.lock().await.recv().await } => {
                match task {
                    Some(t) => runnable.run(t).await,
                    None => break, // Channel closed.
                }
            }
            _ = tick.tick() => {
                runnable.on_tick().await;
            }
            _ = &mut shutdown_rx => {
                break;
            }
        }
    }

    runnable.shutdown().await;
    debug!(worker = index, "worker stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = u32;

        async fn run(&mut self, _task: u32) {
            self.run_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.tick_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Counters {
        run: Arc<AtomicU32>,
        tick: Arc<AtomicU32>,
        shutdown: Arc<AtomicU32>,
    }

    impl Counters {
        fn new() -> Self {
            Self {
                run: Arc::new(AtomicU32::new(0)),
                tick: Arc::new(AtomicU32::new(0)),
                shutdown: Arc::new(AtomicU32::new(0)),
            }
        }

        fn runnable(&self) -> CountingRunnable {
            CountingRunnable {
                run_count: Arc::clone(&self.run),
                tick_count: Arc::clone(&self.tick),
                shutdown_called: Arc::clone(&self.shutdown),
            }
        }
    }

    #[tokio::test]
    async fn workers_share_one_queue() {
        let counters = Counters::new();
        let (tx, rx) = mpsc::channel(16);
        let pool = WorkerPool::spawn(rx, 3, Duration::from_secs(60), |_| counters.runnable());
        assert_eq!(pool.worker_count(), 3);

        for i in 0..10 {
            tx.send(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.run.load(Ordering::SeqCst), 10);

        let rx = pool.stop().await;
        assert!(rx.is_some());
        assert_eq!(counters.shutdown.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn tick_fires_periodically() {
        let counters = Counters::new();
        let (_tx, rx) = mpsc::channel::<u32>(1);
        let pool = WorkerPool::spawn(rx, 1, Duration::from_millis(20), |_| counters.runnable());

        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.stop().await;

        assert!(counters.tick.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn closed_channel_stops_workers() {
        let counters = Counters::new();
        let (tx, rx) = mpsc::channel::<u32>(1);
        let pool = WorkerPool::spawn(rx, 2, Duration::from_secs(60), |_| counters.runnable());
        drop(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counters.shutdown.load(Ordering::SeqCst), 2);
        pool.stop().await;
    }
}
