//! Supervised background-worker lifecycle.
//!
//! Subsystems spawn long-running tasks through a shared `Stopper` and select
//! on `should_stop()` inside their loops. `stop()` flips the signal once;
//! `join()` waits for every worker to observe it and exit.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Stopper {
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Stopper {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a tracked worker task. The future is responsible for selecting
    /// on `should_stop()` and exiting promptly once it fires.
    pub fn run_worker<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.workers.lock().unwrap().push(handle);
    }

    /// Receiver for the shutdown signal, for use with `tokio::select!` via
    /// `rx.wait_for(|stopped| *stopped)`. The receiver also resolves with an
    /// error when the stopper itself is dropped; workers should treat both
    /// the same way.
    pub fn should_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn stop(&self) {
        tracing::info!("stopping background workers");
        let _ = self.stop_tx.send(true);
    }

    /// Wait for all workers spawned so far to finish.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}
