//! HTTP request handlers.
//!
//! Handlers validate the request shape, call one [`WebhookService`]
//! operation and map its error through [`ApiError`].
//!
//! [`WebhookService`]: courier_delivery::WebhookService
//! [`ApiError`]: crate::ApiError

pub mod deliveries;
pub mod events;
pub mod health;
pub mod stats;

pub use deliveries::{get_delivery, retry_delivery};
pub use events::{create_delivery, dispatch_event};
pub use health::{health_check, liveness_check, readiness_check};
pub use stats::subscription_stats;

use uuid::Uuid;

use crate::ApiError;

/// Parses an id taken from the path, answering 400 in the JSON error shape.
pub(crate) fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid id: {raw}")))
}
