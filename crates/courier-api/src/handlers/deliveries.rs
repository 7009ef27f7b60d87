//! Delivery lookup and manual retry.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::models::DeliveryId;
use tracing::instrument;
use super::parse_id;
use crate::{ApiError, AppState};

/// `GET /deliveries/{id}`
#[instrument(name = "get_delivery", skip_all, fields(delivery_id = %id))]
pub async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = DeliveryId::from(parse_id(&id)?);
    let delivery = state.service.get_delivery(id).await?;
    Ok(Json(delivery).into_response())
}

/// `POST /deliveries/{id}/retry`
///
/// Only FAILED deliveries can be retried; anything else answers 409.
#[instrument(name = "retry_delivery", skip_all, fields(delivery_id = %id))]
pub async fn retry_delivery(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = DeliveryId::from(parse_id(&id)?);
    let delivery = state.service.retry_delivery(id).await?;
    Ok((StatusCode::ACCEPTED, Json(delivery)).into_response())
}
