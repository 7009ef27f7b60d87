//! Webhook dispatch engine.
//!
//! ```text
//! ┌────────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ DeliveryEngine │──▶│ Worker Pool  │──▶│ HTTP Client │
//! └────────────────┘   └──────────────┘   └─────────────┘
//!        │                   │                   │
//!        ▼                   ▼                   ▼
//! ┌───────────────┐    ┌──────────────┐   ┌─────────────┐
//! │ Delivery      │    │ Dispatch     │   │ Receiving   │
//! │ Queue + Store │    │ Gate + Guard │   │ Endpoints   │
//! └───────────────┘    └──────────────┘   └─────────────┘
//! ```
//!
//! The engine is an explicit instance: several can run side by side (one per
//! shard, or one per test) without sharing any global state. Dropping an
//! engine cancels its workers.

use std::{sync::Arc, time::Duration};

use courier_core::{storage::Storage, Clock};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    client::{ClientConfig, DeliveryClient},
    error::Result,
    gate::{DispatchGate, GateConfig},
    guard::{GuardConfig, TargetValidator},
    queue::{DeliveryQueue, PostgresDeliveryQueue},
    retry::{RetryPolicy, RetryScheduler},
    store::{DeliveryStore, PostgresDeliveryStore},
    worker::{DeliveryWorker, DispatchContext, JobOutcome},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Jobs processed in parallel; one worker task each.
    pub concurrency: usize,

    /// How often idle workers poll for new jobs.
    pub poll_interval: Duration,

    /// Lease taken on every claim.
    pub lease_duration: Duration,

    /// How often expired leases are swept.
    pub sweep_interval: Duration,

    /// Maximum time to wait for in-flight jobs on shutdown.
    pub shutdown_timeout: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff between attempts.
    pub retry_policy: RetryPolicy,

    /// SSRF guard settings, also applied to the client's resolver.
    #[serde(skip)]
    pub guard: GuardConfig,

    /// Global start-rate limit.
    #[serde(skip)]
    pub gate: GateConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::DEFAULT_CONCURRENCY,
            poll_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            guard: GuardConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of running worker tasks.
    pub active_workers: usize,
    /// Jobs claimed and processed since startup.
    pub jobs_processed: u64,
    /// Attempts answered with 2xx.
    pub successful_deliveries: u64,
    /// Failed attempts followed by a retry.
    pub failed_deliveries: u64,
    /// Deliveries finalized as FAILED.
    pub permanent_failures: u64,
    /// Jobs dropped because their delivery was already final.
    pub duplicate_jobs_skipped: u64,
    /// Expired leases returned to the queue by the sweeper.
    pub stalled_leases_released: u64,
    /// Jobs currently being dispatched.
    pub in_flight_deliveries: u64,
}

/// Dispatch engine coordinating the delivery workers.
pub struct DeliveryEngine {
    ctx: Arc<DispatchContext>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine over the given queue and store.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client or the
    /// dispatch gate cannot be built.
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        store: Arc<dyn DeliveryStore>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client_config =
            ClientConfig { guard: config.guard.clone(), ..config.client_config.clone() };
        let client = Arc::new(DeliveryClient::new(client_config)?);
        let gate = DispatchGate::new(config.gate.clone())?;
        let scheduler = RetryScheduler::new(
            queue.clone(),
            store.clone(),
            config.retry_policy.clone(),
            clock.clone(),
        );

        let ctx = DispatchContext {
            queue,
            store,
            client,
            validator: TargetValidator::new(config.guard.clone()),
            gate,
            scheduler,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            config,
            clock,
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
        })
    }

    /// Creates an engine over Postgres storage.
    ///
    /// # Errors
    ///
    /// See [`DeliveryEngine::new`].
    pub fn postgres(
        storage: Arc<Storage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let queue = Arc::new(PostgresDeliveryQueue::new(storage.clone(), clock.clone()));
        let store = Arc::new(PostgresDeliveryStore::new(storage));
        Self::new(queue, store, config, clock)
    }

    /// Spawns the workers and the stalled-lease sweeper.
    ///
    /// Returns immediately. Use `shutdown()` to stop gracefully, or drop the
    /// engine to cancel workers immediately.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if already started.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(crate::DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            concurrency = self.ctx.config.concurrency,
            max_starts = self.ctx.config.gate.max_starts,
            window_ms = u64::try_from(self.ctx.config.gate.window.as_millis()).unwrap_or(u64::MAX),
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(self.ctx.clone(), self.cancellation_token.clone());
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Stops claiming new jobs and waits for in-flight ones.
    ///
    /// Jobs still running when the grace period ends are aborted; their
    /// leases expire and they return to the queue.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the grace period elapsed.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.ctx.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Whether workers are running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.ctx.stats.read().await.clone()
    }

    /// Processes every job visible right now on the calling task.
    ///
    /// Used by tests and one-shot tooling instead of `start()`. Jobs made
    /// visible later (retries with a delay) are left for the next call.
    ///
    /// # Errors
    ///
    /// Returns the first infrastructure error; remaining jobs stay queued.
    pub async fn process_available(&self) -> Result<Vec<JobOutcome>> {
        let worker = DeliveryWorker::new("inline", self.ctx.clone(), self.cancellation_token.clone());
        let mut outcomes = Vec::new();
        while let Some(outcome) = worker.process_next().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Returns expired leases to the queue once.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::QueueError` if the queue is unavailable.
    pub async fn sweep_stalled(&self) -> Result<u64> {
        sweep_once(&self.ctx).await
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        if self.worker_pool.is_some() && !self.cancellation_token.is_cancelled() {
            warn!("delivery engine dropped without shutdown, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

pub(crate) async fn sweep_once(ctx: &DispatchContext) -> Result<u64> {
    let released = ctx
        .queue
        .release_stalled()
        .await
        .map_err(|e| crate::DeliveryError::queue(format!("failed to release stalled jobs: {e}")))?;

    if released > 0 {
        warn!(released, "released stalled delivery jobs");
        ctx.stats.write().await.stalled_leases_released += released;
    }
    Ok(released)
}
