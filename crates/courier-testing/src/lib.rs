//! Test infrastructure for deterministic delivery testing.
//!
//! Wires the production engine and service to in-memory queue, store and
//! subscription backends driven by a [`TestClock`], so retry schedules can be
//! walked through without waiting on wall-clock time. A local wiremock
//! receiver stands in for third-party endpoints.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{
    models::{Delivery, DeliveryId, WebhookSubscription},
    Clock,
};
use courier_delivery::{
    queue::{mock::InMemoryDeliveryQueue, DeliveryQueue},
    store::{
        mock::{InMemoryDeliveryStore, InMemorySubscriptions},
        DeliveryStore,
    },
    DeliveryEngine, EngineStats, JobOutcome, WebhookService,
};

pub mod fixtures;
pub mod http;

mod env;

pub use courier_core::TestClock;
pub use env::TestEnvBuilder;
pub use fixtures::{sample_payload, SubscriptionBuilder, TEST_EVENT, TEST_SECRET};
pub use http::{MockReceiver, MockResponse};

/// Production engine and service over in-memory backends.
pub struct TestEnv {
    /// Deterministic clock shared by every component.
    pub clock: TestClock,
    /// Delivery records.
    pub store: Arc<InMemoryDeliveryStore>,
    /// Job queue.
    pub queue: Arc<InMemoryDeliveryQueue>,
    /// Subscription records.
    pub subscriptions: Arc<InMemorySubscriptions>,
    /// Entry point used by callers; shareable with an HTTP router.
    pub service: Arc<WebhookService>,
    engine: DeliveryEngine,
}

impl TestEnv {
    /// Environment with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be built.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Builder for custom settings.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Stores a subscription and returns it.
    pub async fn add_subscription(&self, subscription: WebhookSubscription) -> WebhookSubscription {
        self.subscriptions.upsert(subscription.clone()).await;
        subscription
    }

    /// Stores a default HMAC subscription pointing at `url`.
    pub async fn subscribe(&self, url: impl Into<String>) -> WebhookSubscription {
        self.add_subscription(SubscriptionBuilder::with_defaults(url).build()).await
    }

    /// Runs every job visible at the current test time.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine hits an infrastructure failure.
    pub async fn run_delivery_cycle(&self) -> Result<Vec<JobOutcome>> {
        self.engine.process_available().await.context("delivery cycle failed")
    }

    /// Advances the clock to the earliest queued job. Returns false when the
    /// queue is empty.
    pub async fn advance_to_next_job(&self) -> bool {
        let now = self.clock.now_utc();
        let Some(next) = self.queue.jobs().await.into_iter().map(|j| j.run_at).min() else {
            return false;
        };
        if let Ok(wait) = (next - now).to_std() {
            self.clock.advance(wait);
        }
        true
    }

    /// Alternates delivery cycles and clock jumps until the queue drains.
    ///
    /// # Errors
    ///
    /// Returns an error on infrastructure failure or when the queue has not
    /// drained after `max_cycles`.
    pub async fn run_until_settled(&self, max_cycles: usize) -> Result<Vec<JobOutcome>> {
        let mut outcomes = Vec::new();
        for _ in 0..max_cycles {
            outcomes.extend(self.run_delivery_cycle().await?);
            if !self.advance_to_next_job().await {
                return Ok(outcomes);
            }
        }
        let depth = self.queue.depth().await.context("queue depth")?;
        anyhow::bail!("queue still holds {depth} jobs after {max_cycles} cycles")
    }

    /// Moves test time forward.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Looks up a delivery that must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery is missing.
    pub async fn delivery(&self, id: DeliveryId) -> Result<Delivery> {
        self.store
            .find_delivery(id)
            .await
            .context("store lookup failed")?
            .with_context(|| format!("delivery {id} not found"))
    }

    /// Engine counters.
    pub async fn engine_stats(&self) -> EngineStats {
        self.engine.stats().await
    }

    /// The engine under test.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }
}
