//! Reconciliation loop.
//!
//! Pulls keys from a [`WorkQueue`] with a fixed number of workers and hands
//! each to a [`Reconcile`] implementation. Successful keys are forgotten (and
//! requeued if the reconciler asks for it); failed keys come back with
//! backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use choreo_core::ObjectKey;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

use crate::error::{Error, Result};
use crate::queue::WorkQueue;

/// What to do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Wait for the next event.
    Done,
    /// Reconcile again after the delay.
    RequeueAfter(Duration),
}

/// One controller's reconcile function.
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Controller name used in logs.
    fn name(&self) -> &'static str;

    /// Bring the object at `key` to its desired state.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;
}

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Concurrent workers.
    pub workers: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

/// Runs a reconciler against its queue until stopped.
pub struct ReconciliationLoop {
    reconciler: Arc<dyn Reconcile>,
    queue: WorkQueue<ObjectKey>,
    config: LoopConfig,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl ReconciliationLoop {
    /// Create a loop.
    pub fn new(reconciler: Arc<dyn Reconcile>, queue: WorkQueue<ObjectKey>, config: LoopConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            reconciler,
            queue,
            config,
            stop_rx,
            stop_tx,
        }
    }

    /// The queue this loop drains.
    #[must_use]
    pub const fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Run until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for a loop without workers and
    /// `Error::LoopStopped` if a worker task panicked.
    pub async fn run(&mut self) -> Result<()> {
        if self.config.workers == 0 {
            return Err(Error::invalid_config("loop needs at least one worker"));
        }
        let name = self.reconciler.name();
        info!(controller = name, workers = self.config.workers, "Starting reconciliation loop");

        let workers: Vec<_> = (0..self.config.workers)
            .map(|_| {
                let reconciler = Arc::clone(&self.reconciler);
                let queue = self.queue.clone();
                tokio::spawn(async move { while process_next(reconciler.as_ref(), &queue).await {} })
            })
            .collect();

        while !*self.stop_rx.borrow() {
            if self.stop_rx.changed().await.is_err() {
                break;
            }
        }

        self.queue.shut_down();
        let mut panicked = false;
        for worker in workers {
            panicked |= worker.await.is_err();
        }
        info!(controller = name, "Reconciliation loop stopped");
        if panicked {
            return Err(Error::LoopStopped);
        }
        Ok(())
    }

    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Get a stopper handle.
    #[must_use]
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }
}

/// Reconcile the next key. Returns false once the queue is shut down.
pub async fn process_next(reconciler: &dyn Reconcile, queue: &WorkQueue<ObjectKey>) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    let span = info_span!("reconcile", controller = reconciler.name(), key = %key);
    async {
        debug!("Reconcile started");
        match reconciler.reconcile(&key).await {
            Ok(Action::Done) => {
                queue.forget(&key);
                debug!("Reconcile finished");
            }
            Ok(Action::RequeueAfter(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
                debug!(requeue_after_ms = delay.as_millis(), "Reconcile finished");
            }
            Err(e) => {
                error!(error = %e, failures = queue.failures(&key), "Reconcile failed");
                queue.add_rate_limited(key.clone());
            }
        }
    }
    .instrument(span)
    .await;

    queue.done(&key);
    true
}

/// Handle to stop a reconciliation loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    pub(crate) const fn from_sender(stop_tx: watch::Sender<bool>) -> Self {
        Self { stop_tx }
    }

    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}
