//! Construction of [`TestEnv`].

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{Clock, TestClock};
use courier_delivery::{
    gate::GateConfig,
    guard::GuardConfig,
    queue::mock::InMemoryDeliveryQueue,
    retry::{BackoffStrategy, RetryPolicy},
    store::mock::{InMemoryDeliveryStore, InMemorySubscriptions},
    DeliveryConfig, DeliveryEngine, WebhookService,
};

use crate::TestEnv;

/// Builder for [`TestEnv`].
pub struct TestEnvBuilder {
    config: DeliveryConfig,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            config: DeliveryConfig {
                concurrency: 1,
                poll_interval: Duration::from_millis(50),
                shutdown_timeout: Duration::from_secs(5),
                retry_policy: RetryPolicy {
                    base_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(600),
                    jitter_factor: 0.0,
                    backoff_strategy: BackoffStrategy::Exponential,
                },
                // Starts are spaced evenly; keep the spacing negligible.
                gate: GateConfig { max_starts: 10_000, window: Duration::from_secs(1) },
                // Receivers run on loopback.
                guard: GuardConfig { allow_private_networks: true, ..GuardConfig::default() },
                ..DeliveryConfig::default()
            },
        }
    }
}

impl TestEnvBuilder {
    /// Loopback-friendly defaults with zero jitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Replaces the start-rate limit.
    #[must_use]
    pub fn gate(mut self, gate: GateConfig) -> Self {
        self.config.gate = gate;
        self
    }

    /// Enforces the SSRF guard against private networks.
    #[must_use]
    pub fn strict_guard(mut self) -> Self {
        self.config.guard.allow_private_networks = false;
        self
    }

    /// Sets the lease taken on claim.
    #[must_use]
    pub fn lease_duration(mut self, lease: Duration) -> Self {
        self.config.lease_duration = lease;
        self
    }

    /// Builds the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the configuration.
    pub fn build(self) -> Result<TestEnv> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();

        let clock = TestClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(InMemoryDeliveryStore::new(shared.clone()));
        let queue = Arc::new(InMemoryDeliveryQueue::new(shared.clone()));
        let subscriptions = Arc::new(InMemorySubscriptions::new());

        let service = Arc::new(WebhookService::new(
            store.clone(),
            queue.clone(),
            subscriptions.clone(),
            self.config.guard.clone(),
            shared.clone(),
        ));
        let engine = DeliveryEngine::new(queue.clone(), store.clone(), self.config, shared)
            .context("failed to create delivery engine")?;

        Ok(TestEnv { clock, store, queue, subscriptions, service, engine })
    }
}
