//! Worker pool management with structured concurrency.
//!
//! Provides lifecycle management and graceful shutdown for the supervised
//! delivery worker tasks and the stalled-lease sweeper.

use std::{sync::Arc, time::Duration};

use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    engine::sweep_once,
    error::{DeliveryError, Result},
    worker::{DeliveryWorker, DispatchContext},
};

/// Supervised set of delivery worker tasks.
///
/// Holds one task per unit of concurrency plus the sweeper. All tasks share
/// one cancellation token.
pub(crate) struct WorkerPool {
    ctx: Arc<DispatchContext>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    sweeper_handle: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(ctx: Arc<DispatchContext>, cancellation_token: CancellationToken) -> Self {
        Self { ctx, cancellation_token, worker_handles: Vec::new(), sweeper_handle: None }
    }

    /// Spawns all configured workers and the sweeper.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` when concurrency is zero.
    pub(crate) async fn spawn_workers(&mut self) -> Result<()> {
        let worker_count = self.ctx.config.concurrency;
        if worker_count == 0 {
            return Err(DeliveryError::configuration("dispatch concurrency must be positive"));
        }

        info!(worker_count, "spawning delivery workers");

        {
            let mut stats = self.ctx.stats.write().await;
            stats.active_workers = worker_count;
        }

        for worker_id in 0..worker_count {
            let worker = DeliveryWorker::new(
                format!("worker-{worker_id}"),
                self.ctx.clone(),
                self.cancellation_token.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        self.sweeper_handle = Some(tokio::spawn(run_sweeper(
            self.ctx.clone(),
            self.cancellation_token.clone(),
        )));

        info!(spawned_workers = self.worker_handles.len(), "all delivery workers spawned");

        Ok(())
    }

    /// Cancels all tasks and waits for in-flight jobs within `timeout`.
    ///
    /// Tasks still running afterwards are aborted. Their jobs keep their
    /// leases until expiry and are then claimed again.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the timeout elapsed, or
    /// `DeliveryError::WorkerPanic` for the first worker that panicked.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let sweeper = self.sweeper_handle.take();
        let mut abort_handles: Vec<AbortHandle> =
            handles.iter().map(JoinHandle::abort_handle).collect();
        abort_handles.extend(sweeper.as_ref().map(JoinHandle::abort_handle));

        let shutdown_future = async move {
            let mut first_panic = None;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Ok(Ok(())) => {},
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                        if first_panic.is_none() {
                            first_panic = Some(DeliveryError::WorkerPanic {
                                worker_id,
                                error: join_error.to_string(),
                            });
                        }
                    },
                }
            }

            if let Some(sweeper) = sweeper {
                if let Err(join_error) = sweeper.await {
                    warn!(error = %join_error, "sweeper task failed during shutdown");
                }
            }

            first_panic
        };

        let result = match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, aborting remaining tasks"
                );
                for handle in &abort_handles {
                    handle.abort();
                }
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        };

        self.ctx.stats.write().await.active_workers = 0;
        result
    }

    /// Whether any worker is still running.
    pub(crate) fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "worker pool dropped with active workers, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}

async fn run_sweeper(ctx: Arc<DispatchContext>, cancellation_token: CancellationToken) {
    loop {
        tokio::select! {
            () = ctx.clock.sleep(ctx.config.sweep_interval) => {}
            () = cancellation_token.cancelled() => break,
        }

        if let Err(error) = sweep_once(&ctx).await {
            warn!(error = %error, "stalled lease sweep failed");
        }
    }
}
