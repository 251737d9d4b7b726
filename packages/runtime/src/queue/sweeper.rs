//! Periodic recovery of due entries.
//!
//! A generic [`BackgroundWorker`] processes tasks from an mpsc channel via a
//! [`BackgroundRunnable`], with an optional periodic tick. The queue engine
//! runs a [`QueueSweeper`] on it: every tick loads the due `ready` entries of
//! every queue and attempts them, picking up work enqueued by other
//! processes sharing a store and timers lost to a restart.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use switchboard_core::CandidateId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::engine::QueueEngine;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Background worker that processes tasks via an mpsc channel.
///
/// The spawned task listens for submitted tasks, calls `on_tick` every
/// `tick` period (never when `tick` is `None`) and calls `shutdown` when
/// stopped.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. The task channel holds up to 64 pending tasks.
    pub fn start(mut runnable: R, tick: Option<Duration>) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            // First tick fires one period after start, not immediately.
            let mut ticker =
                tick.map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    () = next_tick(ticker.as_mut()) => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submits a task without waiting for channel capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or the channel is full.
    pub fn try_submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .try_send(task)
                .map_err(|err| anyhow::anyhow!("worker channel unavailable: {err}")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Stops the worker, waiting for the worker task to complete.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn next_tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// QueueSweeper
// ---------------------------------------------------------------------------

/// What a sweep covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTask {
    All,
    Queue(CandidateId),
}

/// Runnable sweeping due entries out of the engine's queues.
///
/// Holds the engine weakly so a forgotten worker never keeps it alive.
pub struct QueueSweeper {
    engine: Weak<QueueEngine>,
}

impl QueueSweeper {
    #[must_use]
    pub fn new(engine: Weak<QueueEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl BackgroundRunnable for QueueSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        if let Some(engine) = self.engine.upgrade() {
            engine.sweep(task).await;
        }
    }

    async fn on_tick(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.sweep(SweepTask::All).await;
        }
    }

    async fn shutdown(&mut self) {
        debug!("queue sweeper stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
    }

    impl CountingRunnable {
        fn with_counters() -> (Self, Arc<AtomicU32>, Arc<AtomicU32>, Arc<AtomicU32>) {
            let run_count = Arc::new(AtomicU32::new(0));
            let tick_count = Arc::new(AtomicU32::new(0));
            let shutdown_called = Arc::new(AtomicU32::new(0));
            let runnable = Self {
                run_count: Arc::clone(&run_count),
                tick_count: Arc::clone(&tick_count),
                shutdown_called: Arc::clone(&shutdown_called),
            };
            (runnable, run_count, tick_count, shutdown_called)
        }
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

    #[tokio::test]
    async fn submit_and_stop() {
        let (runnable, run_count, _, shutdown_called) = CountingRunnable::with_counters();
        let mut worker = BackgroundWorker::start(runnable, None);

        worker.try_submit(1).unwrap();
        worker.try_submit(2).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(run_count.load(Ordering::SeqCst), 2);

        worker.stop().await;
        assert_eq!(shutdown_called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_periodically() {
        let (runnable, _, tick_count, _) = CountingRunnable::with_counters();
        let mut worker = BackgroundWorker::start(runnable, Some(Duration::from_millis(20)));

        tokio::time::sleep(Duration::from_millis(110)).await;
        worker.stop().await;

        assert!(tick_count.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_without_period() {
        let (runnable, _, tick_count, _) = CountingRunnable::with_counters();
        let mut worker = BackgroundWorker::start(runnable, None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        worker.stop().await;

        assert_eq!(tick_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let (runnable, _, _, _) = CountingRunnable::with_counters();
        let mut worker = BackgroundWorker::start(runnable, None);
        worker.stop().await;
        assert!(worker.try_submit(1).is_err());
    }

    #[tokio::test]
    async fn sweeper_tolerates_dropped_engine() {
        let mut sweeper = QueueSweeper::new(Weak::new());
        sweeper.run(SweepTask::All).await;
        sweeper.on_tick().await;
    }
}
