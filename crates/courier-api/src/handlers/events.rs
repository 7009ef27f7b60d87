//! Event intake: fan-out and single-subscription deliveries.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::models::SubscriptionId;
use serde::Deserialize;
use tracing::{info, instrument};
use super::parse_id;
use crate::{ApiError, AppState};

/// Event to deliver.
#[derive(Debug, Deserialize)]
pub struct EventRequest {
    /// Event name, e.g. `email.delivered`.
    pub event: String,
    /// Event data placed in the envelope.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventRequest {
    fn parse(body: Result<Json<Self>, JsonRejection>) -> Result<Self, ApiError> {
        let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
        if request.event.trim().is_empty() {
            return Err(ApiError::BadRequest("event must not be empty".to_string()));
        }
        Ok(request)
    }
}

/// `POST /events`: fans the event out to every active subscriber.
#[instrument(name = "dispatch_event", skip_all)]
pub async fn dispatch_event(
    State(state): State<AppState>,
    body: Result<Json<EventRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = EventRequest::parse(body)?;
    let report = state.service.dispatch_event(&request.event, request.data).await?;

    info!(
        event = %report.event,
        enqueued = report.enqueued.len(),
        rejected = report.rejected.len(),
        "event accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(report)).into_response())
}

/// `POST /subscriptions/{id}/deliveries`: queues one delivery.
#[instrument(name = "create_delivery", skip_all, fields(subscription_id = %id))]
pub async fn create_delivery(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<EventRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let id = SubscriptionId::from(parse_id(&id)?);
    let request = EventRequest::parse(body)?;
    let delivery = state
        .service
        .enqueue_delivery(id, &request.event, request.data)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(delivery)).into_response())
}
