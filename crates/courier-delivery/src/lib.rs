//! Webhook dispatch with at-least-once guarantees.
//!
//! Turns subscription events into signed HTTP POSTs and keeps trying until
//! the receiver answers 2xx or the retry budget runs out.
//!
//! # Architecture
//!
//! Work lives in a durable queue of [`DeliveryJob`](courier_core::DeliveryJob)
//! snapshots. Workers claim jobs under a lease, so a crashed worker's job
//! returns to the queue once the lease expires. Each claimed job goes through:
//!
//! 1. **Start gate** - global start-rate limit shared by all workers
//! 2. **SSRF guard** - destination re-checked at dispatch time
//! 3. **HTTP delivery** - signed POST with per-attempt timeout
//! 4. **Status update** - DELIVERED, or RETRYING with the next attempt queued
//!    after exponential backoff, or FAILED once retries are exhausted
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::Storage, RealClock};
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//!
//! # async fn example(storage: Arc<Storage>) -> std::result::Result<(), DeliveryError> {
//! let mut engine =
//!     DeliveryEngine::postgres(storage, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! # engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod client;
pub mod engine;
pub mod error;
pub mod gate;
pub mod guard;
pub mod queue;
pub mod retry;
pub mod service;
pub mod signing;
pub mod store;
mod worker;
mod worker_pool;

pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use service::{FanOutReport, RejectedSubscription, WebhookService};
pub use worker::JobOutcome;

/// Default number of concurrent dispatch workers.
pub const DEFAULT_CONCURRENCY: usize = 10;
