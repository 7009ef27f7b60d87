//! Global job start-rate limit shared by all workers.

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

use crate::error::{DeliveryError, Result};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// At most `max_starts` job starts per `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// Starts allowed per window.
    pub max_starts: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { max_starts: 100, window: Duration::from_secs(1) }
    }
}

/// Start-rate limiter awaited between claim and dispatch.
///
/// Hands out one start every `window / max_starts` with no burst, so any
/// half-open interval of length `window` contains at most `max_starts`
/// starts.
#[derive(Clone)]
pub struct DispatchGate {
    limiter: Arc<Limiter>,
    config: GateConfig,
}

impl DispatchGate {
    /// Builds the limiter.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for a zero rate or window.
    pub fn new(config: GateConfig) -> Result<Self> {
        let max_starts = NonZeroU32::new(config.max_starts)
            .ok_or_else(|| DeliveryError::configuration("dispatch rate limit must be positive"))?;
        let period = config.window / max_starts.get();
        let quota = Quota::with_period(period)
            .ok_or_else(|| DeliveryError::configuration("dispatch rate window must be positive"))?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self { limiter: Arc::new(RateLimiter::direct(quota)), config })
    }

    /// Waits for a start permit.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Limits in effect.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }
}

impl std::fmt::Debug for DispatchGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchGate").field("config", &self.config).finish_non_exhaustive()
    }
}
