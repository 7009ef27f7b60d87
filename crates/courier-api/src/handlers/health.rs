//! Health check handlers for service monitoring.
//!
//! Provides liveness, readiness, and health endpoints for orchestration
//! systems. Deployments without a database report it as skipped.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::{storage::Storage, Clock};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Critical systems failing
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Database connectivity
    pub database: ComponentHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
    /// Component is not configured
    Skipped,
}

/// Runs the component checks against an injected clock.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks every configured component.
    pub async fn health_check(&self, storage: Option<&Storage>) -> HealthResponse {
        let timestamp = self.clock.now_utc();
        let start_time = self.clock.now();

        let (status, message) = match storage {
            None => (ComponentStatus::Skipped, None),
            Some(storage) => match storage.health_check().await {
                Ok(()) => (ComponentStatus::Up, None),
                Err(e) => {
                    error!(error = %e, "database health check failed");
                    (ComponentStatus::Down, Some(format!("database connection failed: {e}")))
                },
            },
        };
        let elapsed = start_time.elapsed();

        let overall = if status == ComponentStatus::Down {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };

        HealthResponse {
            status: overall,
            timestamp,
            checks: HealthChecks {
                database: ComponentHealth {
                    status,
                    message,
                    response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                },
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// `GET /health`
#[instrument(name = "health_check", skip_all)]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let response =
        HealthService::new(state.clock.clone()).health_check(state.storage.as_deref()).await;

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(status = ?response.status, "health check completed");
    (status_code, Json(response)).into_response()
}

/// `GET /ready`: same checks as `/health`.
#[instrument(name = "readiness_check", skip_all)]
pub async fn readiness_check(state: State<AppState>) -> Response {
    health_check(state).await
}

/// `GET /live`: answers while the process serves requests; touches no
/// dependency.
#[instrument(name = "liveness_check", skip_all)]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "courier-api"
    });

    (StatusCode::OK, Json(response)).into_response()
}
