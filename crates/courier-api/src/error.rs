//! Error responses.
//!
//! Every failure leaves the API as `{"error": {"code", "message"}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_delivery::{DeliveryError, ErrorCategory};
use serde::Serialize;
use tracing::error;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Machine-readable code and human-readable message.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error code.
    pub code: &'static str,
    /// Description.
    pub message: String,
}

/// Failure of an API handler.
#[derive(Debug)]
pub enum ApiError {
    /// Request was malformed.
    BadRequest(String),
    /// Failure from the delivery layer.
    Delivery(DeliveryError),
}

impl From<DeliveryError> for ApiError {
    fn from(error: DeliveryError) -> Self {
        Self::Delivery(error)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        let Self::Delivery(error) = self else {
            return (StatusCode::BAD_REQUEST, "bad_request");
        };

        match error {
            DeliveryError::SubscriptionNotFound { .. } => {
                (StatusCode::NOT_FOUND, "subscription_not_found")
            },
            DeliveryError::DeliveryNotFound { .. } => (StatusCode::NOT_FOUND, "delivery_not_found"),
            DeliveryError::SubscriptionInactive { .. } => {
                (StatusCode::CONFLICT, "subscription_inactive")
            },
            DeliveryError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
            DeliveryError::UnsafeTarget { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "unsafe_target"),
            DeliveryError::InvalidAuth { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_auth"),
            DeliveryError::QueueError { .. } | DeliveryError::DatabaseError { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            },
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match &self {
            Self::BadRequest(message) => message.clone(),
            Self::Delivery(error) => {
                if ErrorCategory::from(error) == ErrorCategory::Infrastructure {
                    error!(error = %error, "request failed on infrastructure error");
                }
                error.to_string()
            },
        };

        (status, Json(ErrorResponse { error: ErrorDetail { code, message } })).into_response()
    }
}
