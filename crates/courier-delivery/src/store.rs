//! Persistence seams for deliveries and subscriptions.
//!
//! The engine only talks to these traits. Production wires the Postgres
//! repositories from `courier-core`; tests use the in-memory versions in
//! [`mock`], which enforce the same status transitions through
//! [`Delivery::apply`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{Delivery, DeliveryId, DeliveryStats, StatusUpdate, SubscriptionId, WebhookSubscription},
    storage::Storage,
};

/// Delivery records, owned and mutated by the dispatch pipeline.
pub trait DeliveryStore: Send + Sync + 'static {
    /// Persists a new delivery.
    fn create_delivery(
        &self,
        delivery: Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>>;

    /// Looks up a delivery.
    fn find_delivery(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>>> + Send + '_>>;

    /// Applies a transition-checked status update atomically.
    fn update_delivery_status(
        &self,
        id: DeliveryId,
        update: StatusUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>>;

    /// Moves a FAILED delivery back to PENDING with no attempts.
    fn reset_for_retry(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>>;

    /// Per-status counts of deliveries created since `since`.
    fn delivery_stats(
        &self,
        subscription_id: SubscriptionId,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStats>> + Send + '_>>;
}

/// Read-only view of the subscription collaborator.
pub trait SubscriptionSource: Send + Sync + 'static {
    /// Active subscriptions listening to `event`.
    fn active_subscriptions(
        &self,
        event: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookSubscription>>> + Send + '_>>;

    /// Looks up one subscription regardless of its active flag.
    fn find_subscription(
        &self,
        id: SubscriptionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookSubscription>>> + Send + '_>>;
}

/// Delivery store backed by Postgres.
pub struct PostgresDeliveryStore {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStore {
    /// Wraps shared storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStore for PostgresDeliveryStore {
    fn create_delivery(
        &self,
        delivery: Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>> {
        Box::pin(async move {
            self.storage.deliveries.create(&delivery).await?;
            Ok(delivery)
        })
    }

    fn find_delivery(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>>> + Send + '_>> {
        Box::pin(async move { self.storage.deliveries.find_by_id(id).await })
    }

    fn update_delivery_status(
        &self,
        id: DeliveryId,
        update: StatusUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>> {
        Box::pin(async move { self.storage.deliveries.update_status(id, &update).await })
    }

    fn reset_for_retry(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>> {
        Box::pin(async move { self.storage.deliveries.reset_for_retry(id).await })
    }

    fn delivery_stats(
        &self,
        subscription_id: SubscriptionId,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStats>> + Send + '_>> {
        Box::pin(async move {
            let counts = self.storage.deliveries.count_by_status(subscription_id, since).await?;
            Ok(DeliveryStats::from_counts(counts))
        })
    }
}

/// Subscription source backed by Postgres.
pub struct PostgresSubscriptionSource {
    storage: Arc<Storage>,
}

impl PostgresSubscriptionSource {
    /// Wraps shared storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl SubscriptionSource for PostgresSubscriptionSource {
    fn active_subscriptions(
        &self,
        event: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookSubscription>>> + Send + '_>> {
        let event = event.to_string();
        Box::pin(async move { self.storage.subscriptions.find_active_for_event(&event).await })
    }

    fn find_subscription(
        &self,
        id: SubscriptionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookSubscription>>> + Send + '_>> {
        Box::pin(async move { self.storage.subscriptions.find_by_id(id).await })
    }
}

pub mod mock {
    //! In-memory store and subscription source for tests.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        models::{
            Delivery, DeliveryId, DeliveryStats, DeliveryStatus, StatusUpdate, SubscriptionId,
            WebhookSubscription,
        },
        Clock,
    };
    use tokio::sync::RwLock;

    use super::{DeliveryStore, SubscriptionSource};

    #[derive(Default)]
    struct StoreState {
        deliveries: HashMap<DeliveryId, Delivery>,
        update_errors: u32,
        failing_transition: Option<DeliveryStatus>,
        history: HashMap<DeliveryId, Vec<DeliveryStatus>>,
    }

    /// Delivery store held in process memory.
    pub struct InMemoryDeliveryStore {
        state: Arc<RwLock<StoreState>>,
        clock: Arc<dyn Clock>,
    }

    impl InMemoryDeliveryStore {
        /// Creates an empty store.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self { state: Arc::new(RwLock::new(StoreState::default())), clock }
        }

        /// Makes the next `count` status updates fail with a database error.
        pub async fn inject_update_errors(&self, count: u32) {
            self.state.write().await.update_errors = count;
        }

        /// Makes the next update to `status` fail with a database error.
        /// Updates to other statuses go through.
        pub async fn inject_update_error_on(&self, status: DeliveryStatus) {
            self.state.write().await.failing_transition = Some(status);
        }

        /// Every status the delivery has been in, oldest first.
        pub async fn status_history(&self, id: DeliveryId) -> Vec<DeliveryStatus> {
            self.state.read().await.history.get(&id).cloned().unwrap_or_default()
        }

        /// Number of stored deliveries.
        pub async fn len(&self) -> usize {
            self.state.read().await.deliveries.len()
        }

        /// Whether no delivery is stored.
        pub async fn is_empty(&self) -> bool {
            self.len().await == 0
        }
    }

    impl DeliveryStore for InMemoryDeliveryStore {
        fn create_delivery(
            &self,
            delivery: Delivery,
        ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if state.deliveries.contains_key(&delivery.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "delivery {} already exists",
                        delivery.id
                    )));
                }
                state.history.insert(delivery.id, vec![delivery.status]);
                state.deliveries.insert(delivery.id, delivery.clone());
                Ok(delivery)
            })
        }

        fn find_delivery(
            &self,
            id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>>> + Send + '_>> {
            Box::pin(async move { Ok(self.state.read().await.deliveries.get(&id).cloned()) })
        }

        fn update_delivery_status(
            &self,
            id: DeliveryId,
            update: StatusUpdate,
        ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>> {
            let now = self.clock.now_utc();
            Box::pin(async move {
                let mut state = self.state.write().await;
                if state.update_errors > 0 {
                    state.update_errors -= 1;
                    return Err(CoreError::Database("injected update failure".to_string()));
                }
                if state.failing_transition == Some(update.status) {
                    state.failing_transition = None;
                    return Err(CoreError::Database("injected update failure".to_string()));
                }
                let delivery = state
                    .deliveries
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("delivery {id}")))?;
                delivery.apply(&update, now)?;
                let updated = delivery.clone();
                state.history.entry(id).or_default().push(updated.status);
                Ok(updated)
            })
        }

        fn reset_for_retry(
            &self,
            id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>> {
            let now = self.clock.now_utc();
            Box::pin(async move {
                let mut state = self.state.write().await;
                let delivery = state
                    .deliveries
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("delivery {id}")))?;
                if delivery.status != DeliveryStatus::Failed {
                    return Err(CoreError::InvalidTransition {
                        from: delivery.status,
                        to: DeliveryStatus::Pending,
                    });
                }
                delivery.status = DeliveryStatus::Pending;
                delivery.attempts = 0;
                delivery.status_code = None;
                delivery.response = None;
                delivery.error = None;
                delivery.updated_at = now;
                let reset = delivery.clone();
                state.history.entry(id).or_default().push(DeliveryStatus::Pending);
                Ok(reset)
            })
        }

        fn delivery_stats(
            &self,
            subscription_id: SubscriptionId,
            since: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryStats>> + Send + '_>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let counts = state
                    .deliveries
                    .values()
                    .filter(|d| d.subscription_id == subscription_id && d.created_at >= since)
                    .map(|d| (d.status, 1));
                Ok(DeliveryStats::from_counts(counts))
            })
        }
    }

    /// Subscription source held in process memory.
    #[derive(Default)]
    pub struct InMemorySubscriptions {
        subscriptions: RwLock<Vec<WebhookSubscription>>,
    }

    impl InMemorySubscriptions {
        /// Creates an empty source.
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds or replaces a subscription.
        pub async fn upsert(&self, subscription: WebhookSubscription) {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.retain(|s| s.id != subscription.id);
            subscriptions.push(subscription);
        }

        /// Flips the active flag of a subscription.
        pub async fn set_active(&self, id: SubscriptionId, active: bool) {
            if let Some(s) = self.subscriptions.write().await.iter_mut().find(|s| s.id == id) {
                s.is_active = active;
            }
        }
    }

    impl SubscriptionSource for InMemorySubscriptions {
        fn active_subscriptions(
            &self,
            event: &str,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookSubscription>>> + Send + '_>> {
            let event = event.to_string();
            Box::pin(async move {
                Ok(self
                    .subscriptions
                    .read()
                    .await
                    .iter()
                    .filter(|s| s.subscribes_to(&event))
                    .cloned()
                    .collect())
            })
        }

        fn find_subscription(
            &self,
            id: SubscriptionId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookSubscription>>> + Send + '_>> {
            Box::pin(async move {
                Ok(self.subscriptions.read().await.iter().find(|s| s.id == id).cloned())
            })
        }
    }
}
