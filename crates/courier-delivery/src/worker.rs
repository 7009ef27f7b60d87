//! Dispatch worker: claims one job at a time and drives its delivery through
//! the state machine.

use std::{sync::Arc, time::Duration};

use courier_core::{models::StatusUpdate, Clock, CoreError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    engine::{DeliveryConfig, EngineStats},
    error::{DeliveryError, Result},
    gate::DispatchGate,
    guard::TargetValidator,
    queue::{ClaimedJob, DeliveryQueue},
    retry::{RetryOutcome, RetryScheduler},
    signing::build_auth_headers,
    store::DeliveryStore,
};

/// Slack added to the attempt budget when deciding whether a lease must be
/// extended before dispatch.
const LEASE_MARGIN: Duration = Duration::from_secs(5);

/// Pause after an infrastructure error before claiming again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Everything the workers share. Built once per engine.
pub(crate) struct DispatchContext {
    pub(crate) queue: Arc<dyn DeliveryQueue>,
    pub(crate) store: Arc<dyn DeliveryStore>,
    pub(crate) client: Arc<DeliveryClient>,
    pub(crate) validator: TargetValidator,
    pub(crate) gate: DispatchGate,
    pub(crate) scheduler: RetryScheduler,
    pub(crate) stats: Arc<RwLock<EngineStats>>,
    pub(crate) config: DeliveryConfig,
    pub(crate) clock: Arc<dyn Clock>,
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Receiver answered 2xx; delivery is DELIVERED.
    Delivered,
    /// Attempt failed; the next one is queued.
    RetryScheduled {
        /// Attempt number of the queued job
        next_attempt: u32,
    },
    /// Delivery is FAILED.
    Failed,
    /// Delivery was already terminal; the job was dropped.
    Skipped,
    /// Another worker took over the job.
    LeaseLost,
}

/// Worker that processes queued delivery attempts.
pub struct DeliveryWorker {
    id: String,
    ctx: Arc<DispatchContext>,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    pub(crate) fn new(
        id: impl Into<String>,
        ctx: Arc<DispatchContext>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id: id.into(), ctx, cancellation_token }
    }

    /// Main worker loop: claims and processes jobs until cancelled.
    ///
    /// # Errors
    ///
    /// Never fails today; infrastructure errors are logged and retried after a
    /// pause.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = %self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = %self.id, "delivery worker received shutdown signal");
                break;
            }

            let pause = match self.process_next().await {
                Ok(Some(_)) => None,
                Ok(None) => Some(self.ctx.config.poll_interval),
                Err(error) => {
                    error!(worker_id = %self.id, error = %error, "job processing failed");
                    Some(ERROR_BACKOFF)
                },
            };

            if let Some(pause) = pause {
                tokio::select! {
                    () = self.ctx.clock.sleep(pause) => {}
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!(worker_id = %self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims the next visible job and processes it.
    ///
    /// Returns `None` when the queue had nothing to hand out.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the queue or the store fails. The
    /// job then stays leased and comes back after the lease expires.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>> {
        let claim = self
            .ctx
            .queue
            .claim(&self.id, self.ctx.config.lease_duration)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to claim job: {e}")))?;

        let Some(claim) = claim else {
            return Ok(None);
        };

        debug!(
            worker_id = %self.id,
            delivery_id = %claim.job.delivery_id,
            attempt = claim.job.attempt,
            claim_count = claim.claim_count,
            "claimed delivery job"
        );

        {
            let mut stats = self.ctx.stats.write().await;
            stats.in_flight_deliveries += 1;
        }

        let result = self.process_claim(&claim).await;

        {
            let mut stats = self.ctx.stats.write().await;
            stats.in_flight_deliveries -= 1;
            stats.jobs_processed += 1;
            match &result {
                Ok(JobOutcome::Delivered) => stats.successful_deliveries += 1,
                Ok(JobOutcome::RetryScheduled { .. }) => stats.failed_deliveries += 1,
                Ok(JobOutcome::Failed) => stats.permanent_failures += 1,
                Ok(JobOutcome::Skipped) => stats.duplicate_jobs_skipped += 1,
                Ok(JobOutcome::LeaseLost) | Err(_) => {},
            }
        }

        result.map(Some)
    }

    async fn process_claim(&self, claim: &ClaimedJob) -> Result<JobOutcome> {
        self.ctx.gate.acquire().await;

        if !self.ensure_lease(claim).await? {
            return Ok(JobOutcome::LeaseLost);
        }

        let outcome = match self.attempt(claim).await {
            Ok(outcome) => outcome,
            Err(DeliveryError::InvalidState { status }) if status.is_terminal() => {
                debug!(
                    worker_id = %self.id,
                    delivery_id = %claim.job.delivery_id,
                    status = %status,
                    "delivery already finalized, dropping duplicate job"
                );
                JobOutcome::Skipped
            },
            Err(DeliveryError::DeliveryNotFound { delivery_id }) => {
                warn!(worker_id = %self.id, delivery_id = %delivery_id, "dropping orphaned job");
                JobOutcome::Skipped
            },
            Err(error) => return Err(error),
        };

        let acked = self
            .ctx
            .queue
            .ack(claim)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to ack job: {e}")))?;
        if !acked {
            warn!(
                worker_id = %self.id,
                delivery_id = %claim.job.delivery_id,
                "lease expired before ack, job will be redelivered"
            );
        }

        Ok(outcome)
    }

    /// Extends the lease when the attempt could outlive it. Returns false if
    /// the lease was already lost.
    async fn ensure_lease(&self, claim: &ClaimedJob) -> Result<bool> {
        let budget =
            claim.job.timeout() + self.ctx.validator.config().dns_timeout + LEASE_MARGIN;
        let remaining = (claim.leased_until - self.ctx.clock.now_utc())
            .to_std()
            .unwrap_or(Duration::ZERO);

        if budget <= remaining {
            return Ok(true);
        }

        let lease = budget.max(self.ctx.config.lease_duration);
        let extended = self
            .ctx
            .queue
            .extend_lease(claim, lease)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to extend lease: {e}")))?;

        if !extended {
            warn!(
                worker_id = %self.id,
                delivery_id = %claim.job.delivery_id,
                "lease lost before dispatch"
            );
        }
        Ok(extended)
    }

    async fn attempt(&self, claim: &ClaimedJob) -> Result<JobOutcome> {
        let job = &claim.job;

        self.ctx
            .store
            .update_delivery_status(job.delivery_id, StatusUpdate::processing(job.attempt))
            .await
            .map_err(|e| match e {
                CoreError::NotFound(_) => {
                    DeliveryError::DeliveryNotFound { delivery_id: job.delivery_id.to_string() }
                },
                other => other.into(),
            })?;

        let verdict = self.ctx.validator.check(&job.url).await;
        if !verdict.safe {
            let reason = verdict.reason.unwrap_or_else(|| "target blocked".to_string());
            warn!(
                worker_id = %self.id,
                delivery_id = %job.delivery_id,
                reason = %reason,
                "refusing dispatch to unsafe target"
            );
            return self.record_failure(claim, DeliveryError::unsafe_target(reason)).await;
        }

        if !job.auth.is_complete() {
            let error = DeliveryError::invalid_auth(format!(
                "{} auth configuration is incomplete",
                job.auth.auth_type()
            ));
            return self.record_failure(claim, error).await;
        }

        let headers =
            build_auth_headers(&job.auth, job.body.as_bytes(), Some(self.ctx.clock.unix_seconds()));
        let request = DeliveryRequest::from_job(job, headers);

        match self.ctx.client.deliver(request).await {
            Ok(response) if response.is_success => {
                let update = StatusUpdate::delivered(
                    response.status_code,
                    &response.body,
                    self.ctx.clock.now_utc(),
                );
                self.ctx.store.update_delivery_status(job.delivery_id, update).await?;

                info!(
                    worker_id = %self.id,
                    delivery_id = %job.delivery_id,
                    attempt = job.attempt,
                    status_code = response.status_code,
                    duration_ms = u64::try_from(response.duration.as_millis()).unwrap_or(u64::MAX),
                    "webhook delivered"
                );
                Ok(JobOutcome::Delivered)
            },
            Ok(response) => {
                let error = response.error().unwrap_or_else(|| {
                    DeliveryError::client_error(response.status_code, response.body.clone())
                });
                self.record_failure(claim, error).await
            },
            Err(error) => self.record_failure(claim, error).await,
        }
    }

    async fn record_failure(&self, claim: &ClaimedJob, error: DeliveryError) -> Result<JobOutcome> {
        debug!(
            worker_id = %self.id,
            delivery_id = %claim.job.delivery_id,
            attempt = claim.job.attempt,
            error = %error,
            "delivery attempt failed"
        );

        match self.ctx.scheduler.handle_failure(&claim.job, &error).await? {
            RetryOutcome::Scheduled { next_attempt, .. } => {
                Ok(JobOutcome::RetryScheduled { next_attempt })
            },
            RetryOutcome::Exhausted { .. } => Ok(JobOutcome::Failed),
        }
    }
}
