//! Exponential backoff retry scheduling with jitter.
//!
//! A failed attempt either goes back on the queue with a growing delay or
//! finalizes the delivery as FAILED. Attempts are 1-based and a job may be
//! retried while `attempt <= max_retries`, so a subscription allowing three
//! retries sees four attempts in total.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    models::{DeliveryJob, StatusUpdate},
    Clock,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{DeliveryError, Result},
    queue::DeliveryQueue,
    store::DeliveryStore,
};

/// Backoff configuration shared by all subscriptions.
///
/// The number of attempts is a per-subscription setting carried on the job;
/// the policy only shapes the delay between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for any delay, Retry-After included.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.25,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay grows by the base amount each attempt.
    Linear,
}

/// Everything needed to decide what follows a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed (1-based).
    pub attempt: u32,
    /// Retries the subscription allows after the first attempt.
    pub max_retries: u32,
    /// Error that caused the failure.
    pub error: DeliveryError,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Backoff policy to apply.
    pub policy: RetryPolicy,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry {
        /// When the next attempt becomes claimable
        next_attempt_at: DateTime<Utc>,
        /// Delay from the failure
        delay: Duration,
    },
    /// Finalize the delivery as FAILED.
    GiveUp {
        /// Reason recorded in logs
        reason: String,
    },
}

impl RetryContext {
    /// Creates a retry context for a failed delivery.
    pub fn new(
        attempt: u32,
        max_retries: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt, max_retries, error, failed_at, policy }
    }

    /// Context for a failed attempt of `job`.
    pub fn for_job(
        job: &DeliveryJob,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self::new(job.attempt, job.max_retries, error, failed_at, policy)
    }

    /// Determines if and when to retry.
    pub fn decide_retry(&self) -> RetryDecision {
        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        if self.attempt > self.max_retries {
            return RetryDecision::GiveUp {
                reason: format!("retries exhausted after {} attempts", self.attempt),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay, delay }
    }

    /// Delay until the next attempt.
    ///
    /// A Retry-After hint can only lengthen the backoff, and the result never
    /// exceeds the policy maximum.
    pub fn calculate_delay(&self) -> Duration {
        let base_delay = match self.policy.backoff_strategy {
            BackoffStrategy::Fixed => self.policy.base_delay,
            BackoffStrategy::Linear => self.policy.base_delay * self.attempt.max(1),
            BackoffStrategy::Exponential => {
                let exponent = self.attempt.saturating_sub(1).min(20);
                let multiplier = 2_u32.saturating_pow(exponent);
                self.policy.base_delay * multiplier
            },
        };

        let capped_delay = std::cmp::min(base_delay, self.policy.max_delay);
        let jittered_delay = apply_jitter(capped_delay, self.policy.jitter_factor);

        let delay = match self.error.retry_after_seconds() {
            Some(seconds) => jittered_delay.max(Duration::from_secs(seconds)),
            None => jittered_delay,
        };

        std::cmp::min(delay, self.policy.max_delay)
    }
}

/// Randomizes the delay by ±jitter_factor percent.
///
/// With jitter_factor=0.25, a 10s delay becomes 7.5s to 12.5s.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

/// What the scheduler did with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Delivery is RETRYING and the next attempt is queued.
    Scheduled {
        /// Attempt number of the queued job
        next_attempt: u32,
        /// Delay before it becomes claimable
        delay: Duration,
    },
    /// Delivery is FAILED.
    Exhausted {
        /// Why no further attempt was queued
        reason: String,
    },
}

/// Persists the outcome of a failed attempt and queues the next one.
pub struct RetryScheduler {
    queue: Arc<dyn DeliveryQueue>,
    store: Arc<dyn DeliveryStore>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    /// Creates a scheduler.
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        store: Arc<dyn DeliveryStore>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { queue, store, policy, clock }
    }

    /// Backoff policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Records a failed attempt of `job`.
    ///
    /// RETRYING is persisted before the next job is queued, so an observer
    /// never sees attempt N+1 queued while attempt N still reads as
    /// PROCESSING.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the store or the queue fails. The
    /// caller must then leave its lease unacknowledged.
    pub async fn handle_failure(
        &self,
        job: &DeliveryJob,
        error: &DeliveryError,
    ) -> Result<RetryOutcome> {
        let context =
            RetryContext::for_job(job, error.clone(), self.clock.now_utc(), self.policy.clone());
        let message = error.to_string();

        match context.decide_retry() {
            RetryDecision::Retry { delay, .. } => {
                let update =
                    StatusUpdate::retrying(message, error.status_code(), error.response_body());
                self.store.update_delivery_status(job.delivery_id, update).await?;

                let next = job.next_attempt();
                let next_attempt = next.attempt;
                self.queue.enqueue(next, delay).await.map_err(|e| DeliveryError::queue(e.to_string()))?;

                info!(
                    delivery_id = %job.delivery_id,
                    attempt = job.attempt,
                    next_attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "delivery scheduled for retry"
                );
                Ok(RetryOutcome::Scheduled { next_attempt, delay })
            },
            RetryDecision::GiveUp { reason } => {
                let update =
                    StatusUpdate::failed(message, error.status_code(), error.response_body());
                self.store.update_delivery_status(job.delivery_id, update).await?;

                warn!(
                    delivery_id = %job.delivery_id,
                    attempt = job.attempt,
                    reason = %reason,
                    "delivery permanently failed"
                );
                Ok(RetryOutcome::Exhausted { reason })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() }
    }

    fn context(attempt: u32, error: DeliveryError, policy: RetryPolicy) -> RetryContext {
        RetryContext::new(attempt, 3, error, Utc::now(), policy)
    }

    #[test]
    fn exponential_backoff_increases_correctly() {
        let delays: Vec<_> = (1..=5)
            .map(|attempt| {
                RetryContext::new(attempt, 10, DeliveryError::network("reset"), Utc::now(), no_jitter())
                    .calculate_delay()
            })
            .collect();

        let expected: Vec<_> = [1, 2, 4, 8, 16].into_iter().map(Duration::from_secs).collect();
        assert_eq!(delays, expected);
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let linear = RetryPolicy { backoff_strategy: BackoffStrategy::Linear, ..no_jitter() };
        assert_eq!(
            context(3, DeliveryError::network("x"), linear).calculate_delay(),
            Duration::from_secs(3)
        );

        let fixed = RetryPolicy { backoff_strategy: BackoffStrategy::Fixed, ..no_jitter() };
        assert_eq!(
            context(3, DeliveryError::network("x"), fixed).calculate_delay(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(10), ..no_jitter() };
        let delay =
            RetryContext::new(15, 20, DeliveryError::network("x"), Utc::now(), policy).calculate_delay();
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn retries_while_attempt_within_max_retries() {
        let error = DeliveryError::server_error(500, "boom");
        assert!(matches!(
            context(3, error.clone(), no_jitter()).decide_retry(),
            RetryDecision::Retry { .. }
        ));

        match context(4, error, no_jitter()).decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("exhausted")),
            RetryDecision::Retry { .. } => unreachable!("fourth attempt is the last"),
        }
    }

    #[test]
    fn zero_max_retries_gives_up_immediately() {
        let ctx = RetryContext::new(1, 0, DeliveryError::timeout(Duration::from_secs(1)), Utc::now(), no_jitter());
        assert!(matches!(ctx.decide_retry(), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn non_retryable_errors_rejected() {
        match context(1, DeliveryError::unsafe_target("loopback"), no_jitter()).decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("non-retryable")),
            RetryDecision::Retry { .. } => unreachable!("unsafe targets are final"),
        }
    }

    #[test]
    fn retry_after_lengthens_but_never_shortens() {
        let longer = context(1, DeliveryError::rate_limited(429, Some(120), ""), no_jitter());
        assert_eq!(longer.calculate_delay(), Duration::from_secs(120));

        let shorter = context(4, DeliveryError::rate_limited(429, Some(1), ""), no_jitter());
        assert_eq!(shorter.calculate_delay(), Duration::from_secs(8));
    }

    #[test]
    fn retry_after_capped_at_max_delay() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(60), ..no_jitter() };
        let ctx = context(1, DeliveryError::rate_limited(503, Some(86_400), ""), policy);
        assert_eq!(ctx.calculate_delay(), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy { jitter_factor: 0.5, ..RetryPolicy::default() };
        for _ in 0..100 {
            let delay = context(3, DeliveryError::network("x"), policy.clone()).calculate_delay();
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn next_attempt_time_follows_failure() {
        let failed_at = Utc::now();
        let ctx = RetryContext::new(2, 3, DeliveryError::network("x"), failed_at, no_jitter());
        match ctx.decide_retry() {
            RetryDecision::Retry { next_attempt_at, delay } => {
                assert_eq!(delay, Duration::from_secs(2));
                assert_eq!(next_attempt_at, failed_at + chrono::Duration::seconds(2));
            },
            RetryDecision::GiveUp { reason } => unreachable!("unexpected give up: {reason}"),
        }
    }
}
