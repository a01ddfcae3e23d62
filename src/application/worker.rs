//! The worker pool that drives payment lifecycles.
//!
//! Workers poll the store for the next eligible row, take its exclusive
//! lock, dispatch to the matching lifecycle handler and commit the returned
//! patch. An unexpected fault rolls back: the lock is dropped without a
//! commit, `state_attempts` stays untouched and the row becomes eligible
//! again.

use super::engine::Dependencies;
use super::lifecycle::{self, HandlerFault};
use crate::domain::payment::PaymentState;
use crate::domain::ports::{Clock, PaymentLock, PaymentStore};
use crate::error::{LifecycleError, PaymentFailure, StoreError};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Shutdown signal sender.
pub type ShutdownTx = broadcast::Sender<()>;

/// Create a shutdown channel for a worker pool.
pub fn shutdown_channel() -> (ShutdownTx, broadcast::Receiver<()>) {
    broadcast::channel(1)
}

/// Cooperative cancellation token checked at suspension boundaries.
///
/// The signal latches: once observed, every later check reports shutdown.
pub struct ShutdownGuard {
    rx: broadcast::Receiver<()>,
    observed: bool,
}

impl ShutdownGuard {
    pub fn new(tx: &ShutdownTx) -> Self {
        Self {
            rx: tx.subscribe(),
            observed: false,
        }
    }

    /// Wait for the shutdown signal.
    pub async fn wait(&mut self) {
        if self.observed {
            return;
        }
        let _ = self.rx.recv().await;
        self.observed = true;
    }

    /// Check if shutdown has been signaled (non-blocking).
    pub fn is_shutdown(&mut self) -> bool {
        use broadcast::error::TryRecvError;
        if !self.observed {
            self.observed = !matches!(self.rx.try_recv(), Err(TryRecvError::Empty));
        }
        self.observed
    }
}

/// A fixed-size pool of worker tasks.
pub struct WorkerPool {
    shutdown: ShutdownTx,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.worker_count` workers over the shared dependencies.
    pub fn start(deps: Arc<Dependencies>) -> Self {
        let (shutdown, _) = shutdown_channel();
        let handles = (0..deps.config.worker_count)
            .map(|index| {
                let deps = deps.clone();
                let guard = ShutdownGuard::new(&shutdown);
                tokio::spawn(run_worker(index, deps, guard))
            })
            .collect();
        Self { shutdown, handles }
    }

    /// Signals shutdown and waits for every worker to stop. Workers release
    /// any held row lock promptly; in-flight attempts roll back.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_worker(index: usize, deps: Arc<Dependencies>, mut shutdown: ShutdownGuard) {
    tracing::debug!(worker = index, "worker started");
    loop {
        if shutdown.is_shutdown() {
            break;
        }
        match process_next(&deps, &mut shutdown).await {
            Ok(true) => {}
            Ok(false) => {
                let idle = deps.config.idle_interval();
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
            Err(error) => {
                tracing::error!(worker = index, %error, "store error in worker loop");
                let idle = deps.config.idle_interval();
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }
    }
    tracing::debug!(worker = index, "worker stopped");
}

/// One scheduling step: lock the next eligible payment and run its handler.
///
/// Returns `Ok(true)` when a transition was committed, `Ok(false)` when
/// there was nothing to do (or the attempt rolled back). Public so tests
/// can step the machine deterministically.
pub async fn process_next(
    deps: &Dependencies,
    shutdown: &mut ShutdownGuard,
) -> Result<bool, StoreError> {
    let now = deps.clock.now();
    let Some(lock) = deps.store.next_eligible(now).await? else {
        return Ok(false);
    };
    let payment = lock.payment().clone();

    // Bound guard: a row past its per-state retry bound stops here.
    if let Some(bound) = lifecycle::max_attempts(&deps.config, payment.state) {
        if payment.state_attempts > bound {
            lock.commit(lifecycle::cancelling_patch(
                PaymentFailure::Lifecycle(LifecycleError::RetriesExhausted),
                now,
            ))
            .await?;
            return Ok(true);
        }
    }

    let handled = match payment.state {
        PaymentState::Quoting => lifecycle::handle_quoting(deps, &payment, shutdown).await,
        PaymentState::Ready | PaymentState::Activated => {
            lifecycle::handle_funding(deps, &payment).await
        }
        PaymentState::Sending => lifecycle::handle_sending(deps, &payment, shutdown).await,
        PaymentState::Cancelling => lifecycle::handle_cancelling(deps, &payment, shutdown).await,
        PaymentState::Completed | PaymentState::Cancelled => {
            // Terminal rows are never eligible; nothing to do.
            return Ok(false);
        }
    };

    match handled {
        Ok(patch) => {
            let updated = lock.commit(patch).await?;
            if updated.state != payment.state {
                tracing::info!(
                    payment = %payment.id,
                    from = %payment.state,
                    to = %updated.state,
                    "state transition"
                );
            }
            Ok(true)
        }
        Err(HandlerFault::Shutdown) => {
            // Roll back; the row stays eligible for the next pool.
            drop(lock);
            Ok(false)
        }
        Err(fault) => {
            tracing::error!(
                payment = %payment.id,
                state = %payment.state,
                attempts = payment.state_attempts,
                error = %fault,
                "handler fault, rolling back"
            );
            drop(lock);
            Ok(false)
        }
    }
}
