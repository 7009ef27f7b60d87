//! Read-only access to webhook subscriptions.
//!
//! Subscriptions are managed elsewhere; this repository only reads the
//! columns the delivery pipeline needs.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{AuthConfig, AuthType, SubscriptionId, TenantId, WebhookSubscription},
};

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, url, auth_type, auth_header_name, auth_value, \
                                    secret, timeout_ms, max_retries, is_active, events";

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: SubscriptionId,
    tenant_id: TenantId,
    url: String,
    auth_type: String,
    auth_header_name: Option<String>,
    auth_value: Option<String>,
    secret: Option<String>,
    timeout_ms: i64,
    max_retries: i32,
    is_active: bool,
    events: Vec<String>,
}

impl TryFrom<SubscriptionRow> for WebhookSubscription {
    type Error = crate::error::CoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        let auth_type: AuthType = row.auth_type.parse()?;
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            url: row.url,
            auth: AuthConfig::from_record(auth_type, row.auth_header_name, row.auth_value, row.secret),
            timeout_ms: u64::try_from(row.timeout_ms).unwrap_or(0),
            max_retries: u32::try_from(row.max_retries).unwrap_or(0),
            is_active: row.is_active,
            events: row.events,
        })
    }
}

/// Repository for subscription lookups.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a subscription by id, active or not.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or the stored auth type is unknown.
    pub async fn find_by_id(&self, id: SubscriptionId) -> Result<Option<WebhookSubscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        row.map(WebhookSubscription::try_from).transpose()
    }

    /// Active subscriptions listening to `event` (or to `*`).
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a stored auth type is unknown.
    pub async fn find_active_for_event(&self, event: &str) -> Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions
            WHERE is_active AND ($1 = ANY(events) OR '*' = ANY(events))
            ORDER BY created_at ASC
            "#
        ))
        .bind(event)
        .fetch_all(&*self.pool)
        .await?;

        rows.into_iter().map(WebhookSubscription::try_from).collect()
    }
}
