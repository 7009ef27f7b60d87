//! Core domain models, storage and time primitives.
//!
//! Holds the delivery state machine, the job snapshot that travels through
//! the queue, and the PostgreSQL repositories. The delivery and API crates
//! build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptOutcome, AuthConfig, AuthType, Delivery, DeliveryId, DeliveryJob, DeliveryStats,
    DeliveryStatus, JobId, StatusUpdate, SubscriptionId, TenantId, WebhookEnvelope,
    WebhookSubscription,
};
pub use time::{Clock, RealClock, TestClock};
