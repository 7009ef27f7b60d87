//! Operations exposed to the rest of the application.
//!
//! Validation happens here, before anything is persisted or queued:
//! an inactive subscription, incomplete auth material or an unsafe target is
//! reported to the caller synchronously and never reaches a worker.

use std::{sync::Arc, time::Duration};

use courier_core::{
    models::{
        Delivery, DeliveryId, DeliveryJob, DeliveryStats, DeliveryStatus, StatusUpdate,
        SubscriptionId, WebhookEnvelope, WebhookSubscription,
    },
    storage::Storage,
    Clock,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, ErrorCategory, Result},
    guard::{GuardConfig, TargetValidator},
    queue::{DeliveryQueue, PostgresDeliveryQueue},
    store::{DeliveryStore, PostgresDeliveryStore, PostgresSubscriptionSource, SubscriptionSource},
};

/// Result of fanning one event out to its subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    /// Event name.
    pub event: String,
    /// Deliveries created and queued.
    pub enqueued: Vec<DeliveryId>,
    /// Subscriptions skipped by validation.
    pub rejected: Vec<RejectedSubscription>,
}

/// A subscription that did not receive a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedSubscription {
    /// Subscription identifier.
    pub subscription_id: SubscriptionId,
    /// Validation failure.
    pub reason: String,
}

/// Entry point for creating, retrying and inspecting deliveries.
pub struct WebhookService {
    store: Arc<dyn DeliveryStore>,
    queue: Arc<dyn DeliveryQueue>,
    subscriptions: Arc<dyn SubscriptionSource>,
    validator: TargetValidator,
    clock: Arc<dyn Clock>,
}

impl WebhookService {
    /// Creates a service over the given collaborators.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        queue: Arc<dyn DeliveryQueue>,
        subscriptions: Arc<dyn SubscriptionSource>,
        guard: GuardConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, queue, subscriptions, validator: TargetValidator::new(guard), clock }
    }

    /// Creates a service over Postgres storage.
    pub fn postgres(storage: Arc<Storage>, guard: GuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Arc::new(PostgresDeliveryStore::new(storage.clone())),
            Arc::new(PostgresDeliveryQueue::new(storage.clone(), clock.clone())),
            Arc::new(PostgresSubscriptionSource::new(storage)),
            guard,
            clock,
        )
    }

    /// Creates a PENDING delivery for one subscription and queues attempt 1.
    ///
    /// # Errors
    ///
    /// - `SubscriptionNotFound` / `SubscriptionInactive`
    /// - `InvalidAuth` when the auth material is incomplete
    /// - `UnsafeTarget` when the URL fails the SSRF guard
    /// - `QueueError` when the job could not be queued; the delivery is then
    ///   recorded as FAILED with the queue error so it stays visible
    pub async fn enqueue_delivery(
        &self,
        subscription_id: SubscriptionId,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<Delivery> {
        let subscription = self.active_subscription(subscription_id).await?;
        self.start_delivery(&subscription, event, payload).await
    }

    /// Fans an event out to every active subscription listening to it.
    ///
    /// Subscriptions failing validation are reported and skipped.
    ///
    /// # Errors
    ///
    /// Stops at the first infrastructure error. Deliveries created before it
    /// stay queued.
    pub async fn dispatch_event(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<FanOutReport> {
        let subscriptions = self.subscriptions.active_subscriptions(event).await?;
        let mut report = FanOutReport { event: event.to_string(), ..FanOutReport::default() };

        for subscription in &subscriptions {
            match self.start_delivery(subscription, event, payload.clone()).await {
                Ok(delivery) => report.enqueued.push(delivery.id),
                Err(error) if ErrorCategory::from(&error) == ErrorCategory::Validation => {
                    warn!(
                        subscription_id = %subscription.id,
                        event,
                        error = %error,
                        "subscription skipped during fan-out"
                    );
                    report.rejected.push(RejectedSubscription {
                        subscription_id: subscription.id,
                        reason: error.to_string(),
                    });
                },
                Err(error) => return Err(error),
            }
        }

        info!(
            event,
            matched = subscriptions.len(),
            enqueued = report.enqueued.len(),
            rejected = report.rejected.len(),
            "event fanned out"
        );
        Ok(report)
    }

    /// Starts a fresh attempt cycle for a FAILED delivery.
    ///
    /// The delivery goes back to PENDING with zero attempts and a new
    /// envelope timestamp; the subscription's current URL and auth are used.
    ///
    /// # Errors
    ///
    /// - `DeliveryNotFound`
    /// - `InvalidState` unless the delivery is FAILED
    /// - the validation and queue errors of [`Self::enqueue_delivery`]
    pub async fn retry_delivery(&self, delivery_id: DeliveryId) -> Result<Delivery> {
        let delivery = self.get_delivery(delivery_id).await?;
        if delivery.status != DeliveryStatus::Failed {
            return Err(DeliveryError::InvalidState { status: delivery.status });
        }

        let subscription = self.active_subscription(delivery.subscription_id).await?;
        self.validate_subscription(&subscription).await?;

        let reset = self.store.reset_for_retry(delivery_id).await?;
        self.enqueue_first_attempt(&reset, &subscription).await?;

        info!(delivery_id = %delivery_id, "manual retry queued");
        Ok(reset)
    }

    /// Looks up a delivery.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryNotFound` if it does not exist.
    pub async fn get_delivery(&self, delivery_id: DeliveryId) -> Result<Delivery> {
        self.store
            .find_delivery(delivery_id)
            .await?
            .ok_or_else(|| DeliveryError::DeliveryNotFound { delivery_id: delivery_id.to_string() })
    }

    /// Counts of deliveries created within `window` for one subscription.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the store is unavailable.
    pub async fn get_delivery_stats(
        &self,
        subscription_id: SubscriptionId,
        window: Duration,
    ) -> Result<DeliveryStats> {
        let window = chrono::Duration::from_std(window)
            .map_err(|_| DeliveryError::configuration("stats window out of range"))?;
        let since = self.clock.now_utc() - window;
        Ok(self.store.delivery_stats(subscription_id, since).await?)
    }

    async fn active_subscription(&self, id: SubscriptionId) -> Result<WebhookSubscription> {
        let subscription = self
            .subscriptions
            .find_subscription(id)
            .await?
            .ok_or_else(|| DeliveryError::SubscriptionNotFound { subscription_id: id.to_string() })?;

        if !subscription.is_active {
            return Err(DeliveryError::SubscriptionInactive { subscription_id: id.to_string() });
        }
        Ok(subscription)
    }

    async fn validate_subscription(&self, subscription: &WebhookSubscription) -> Result<()> {
        if !subscription.auth.is_complete() {
            return Err(DeliveryError::invalid_auth(format!(
                "{} auth configuration is incomplete",
                subscription.auth.auth_type()
            )));
        }

        let verdict = self.validator.check(&subscription.url).await;
        if !verdict.safe {
            return Err(DeliveryError::unsafe_target(
                verdict.reason.unwrap_or_else(|| "target blocked".to_string()),
            ));
        }
        Ok(())
    }

    async fn start_delivery(
        &self,
        subscription: &WebhookSubscription,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<Delivery> {
        self.validate_subscription(subscription).await?;

        let delivery = Delivery::new(subscription.id, event, payload, self.clock.now_utc());
        let delivery = self.store.create_delivery(delivery).await?;
        self.enqueue_first_attempt(&delivery, subscription).await?;

        info!(
            delivery_id = %delivery.id,
            subscription_id = %subscription.id,
            event,
            "delivery queued"
        );
        Ok(delivery)
    }

    async fn enqueue_first_attempt(
        &self,
        delivery: &Delivery,
        subscription: &WebhookSubscription,
    ) -> Result<()> {
        let body = WebhookEnvelope::for_delivery(delivery, self.clock.now_utc()).to_body()?;
        let job = DeliveryJob::first_attempt(delivery, subscription, body);

        if let Err(e) = self.queue.enqueue(job, Duration::ZERO).await {
            let message = format!("failed to enqueue delivery: {e}");
            error!(delivery_id = %delivery.id, error = %e, "enqueue failed");

            let update = StatusUpdate::failed(message.clone(), None, None);
            if let Err(persist) = self.store.update_delivery_status(delivery.id, update).await {
                error!(
                    delivery_id = %delivery.id,
                    error = %persist,
                    "could not record enqueue failure"
                );
            }
            return Err(DeliveryError::queue(message));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{
        models::{AuthConfig, TenantId},
        TestClock,
    };
    use serde_json::json;

    use super::*;
    use crate::{
        queue::mock::InMemoryDeliveryQueue,
        store::mock::{InMemoryDeliveryStore, InMemorySubscriptions},
    };

    struct Fixture {
        clock: TestClock,
        store: Arc<InMemoryDeliveryStore>,
        queue: Arc<InMemoryDeliveryQueue>,
        subscriptions: Arc<InMemorySubscriptions>,
        service: WebhookService,
    }

    fn fixture() -> Fixture {
        let clock = TestClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(InMemoryDeliveryStore::new(shared.clone()));
        let queue = Arc::new(InMemoryDeliveryQueue::new(shared.clone()));
        let subscriptions = Arc::new(InMemorySubscriptions::new());
        let service = WebhookService::new(
            store.clone(),
            queue.clone(),
            subscriptions.clone(),
            GuardConfig::default(),
            shared,
        );
        Fixture { clock, store, queue, subscriptions, service }
    }

    fn subscription(url: &str) -> WebhookSubscription {
        WebhookSubscription {
            id: SubscriptionId::new(),
            tenant_id: TenantId::new(),
            url: url.to_string(),
            auth: AuthConfig::Hmac { secret: "whsec_test".to_string() },
            timeout_ms: 5_000,
            max_retries: 3,
            is_active: true,
            events: vec!["email.delivered".to_string()],
        }
    }

    #[tokio::test]
    async fn enqueue_creates_pending_delivery_and_first_job() {
        let f = fixture();
        let sub = subscription("https://203.0.114.10/hook");
        f.subscriptions.upsert(sub.clone()).await;

        let delivery =
            f.service.enqueue_delivery(sub.id, "email.delivered", json!({"id": 7})).await.unwrap();

        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempts, 0);
        let jobs = f.queue.jobs_for(delivery.id).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.attempt, 1);

        let envelope: WebhookEnvelope = serde_json::from_str(&jobs[0].job.body).unwrap();
        assert_eq!(envelope.event, "email.delivered");
        assert_eq!(envelope.data, json!({"id": 7}));
    }

    #[tokio::test]
    async fn unsafe_target_rejected_before_anything_is_stored() {
        let f = fixture();
        let sub = subscription("http://169.254.169.254/latest/meta-data");
        f.subscriptions.upsert(sub.clone()).await;

        let err = f.service.enqueue_delivery(sub.id, "email.delivered", json!({})).await.unwrap_err();

        assert!(matches!(err, DeliveryError::UnsafeTarget { .. }));
        assert!(f.store.is_empty().await);
        assert_eq!(f.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn incomplete_auth_rejected() {
        let f = fixture();
        let mut sub = subscription("https://203.0.114.10/hook");
        sub.auth = AuthConfig::ApiKey { header: "X-Key".to_string(), value: String::new() };
        f.subscriptions.upsert(sub.clone()).await;

        let err = f.service.enqueue_delivery(sub.id, "email.delivered", json!({})).await.unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidAuth { .. }));
    }

    #[tokio::test]
    async fn inactive_and_unknown_subscriptions_rejected() {
        let f = fixture();
        let mut sub = subscription("https://203.0.114.10/hook");
        sub.is_active = false;
        f.subscriptions.upsert(sub.clone()).await;

        assert!(matches!(
            f.service.enqueue_delivery(sub.id, "e", json!({})).await,
            Err(DeliveryError::SubscriptionInactive { .. })
        ));
        assert!(matches!(
            f.service.enqueue_delivery(SubscriptionId::new(), "e", json!({})).await,
            Err(DeliveryError::SubscriptionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn enqueue_failure_is_recorded_on_the_delivery() {
        let f = fixture();
        let sub = subscription("https://203.0.114.10/hook");
        f.subscriptions.upsert(sub.clone()).await;
        f.queue.inject_enqueue_error("broker unavailable").await;

        let err = f.service.enqueue_delivery(sub.id, "email.delivered", json!({})).await.unwrap_err();
        assert!(matches!(err, DeliveryError::QueueError { .. }));

        let stats = f.service.get_delivery_stats(sub.id, Duration::from_secs(60)).await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn fan_out_reports_rejections_and_continues() {
        let f = fixture();
        let good = subscription("https://203.0.114.10/hook");
        let blocked = subscription("http://10.0.0.8/hook");
        f.subscriptions.upsert(good.clone()).await;
        f.subscriptions.upsert(blocked.clone()).await;

        let report = f.service.dispatch_event("email.delivered", json!({})).await.unwrap();

        assert_eq!(report.enqueued.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].subscription_id, blocked.id);
        assert!(f.service.dispatch_event("contact.created", json!({})).await.unwrap().enqueued.is_empty());
    }

    #[tokio::test]
    async fn retry_rejected_unless_failed() {
        let f = fixture();
        let sub = subscription("https://203.0.114.10/hook");
        f.subscriptions.upsert(sub.clone()).await;
        let delivery = f.service.enqueue_delivery(sub.id, "email.delivered", json!({})).await.unwrap();

        let err = f.service.retry_delivery(delivery.id).await.unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidState { status: DeliveryStatus::Pending }));

        assert!(matches!(
            f.service.retry_delivery(DeliveryId::new()).await,
            Err(DeliveryError::DeliveryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn retry_of_failed_delivery_starts_fresh_cycle() {
        let f = fixture();
        let sub = subscription("https://203.0.114.10/hook");
        f.subscriptions.upsert(sub.clone()).await;
        let delivery = f.service.enqueue_delivery(sub.id, "email.delivered", json!({})).await.unwrap();

        f.store.update_delivery_status(delivery.id, StatusUpdate::processing(1)).await.unwrap();
        f.store
            .update_delivery_status(delivery.id, StatusUpdate::failed("HTTP 500: boom", Some(500), Some("boom")))
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(30));
        let reset = f.service.retry_delivery(delivery.id).await.unwrap();

        assert_eq!(reset.status, DeliveryStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert!(reset.error.is_none());

        let jobs = f.queue.jobs_for(delivery.id).await;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.job.attempt == 1));
        assert_ne!(jobs[0].job.body, jobs[1].job.body);
    }
}
