//! Per-subscription delivery statistics.

use std::time::Duration;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use courier_core::models::SubscriptionId;
use serde::Deserialize;
use tracing::instrument;
use super::parse_id;
use crate::{ApiError, AppState};

const DEFAULT_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Query string of the stats endpoint.
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// Look-back window in seconds; 24 hours when absent.
    pub window_secs: Option<u64>,
}

/// `GET /subscriptions/{id}/stats?window_secs=N`
#[instrument(name = "subscription_stats", skip_all, fields(subscription_id = %id))]
pub async fn subscription_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let id = SubscriptionId::from(parse_id(&id)?);
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let window_secs = query.window_secs.unwrap_or(DEFAULT_WINDOW_SECS);
    if window_secs == 0 {
        return Err(ApiError::BadRequest("window_secs must be positive".to_string()));
    }

    let stats = state
        .service
        .get_delivery_stats(id, Duration::from_secs(window_secs))
        .await?;
    Ok(Json(stats).into_response())
}
