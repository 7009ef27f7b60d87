//! Subscription and payload builders with sensible defaults.

use courier_core::models::{AuthConfig, SubscriptionId, TenantId, WebhookSubscription};
use serde_json::{json, Value};

/// Secret used by [`SubscriptionBuilder::with_defaults`].
pub const TEST_SECRET: &str = "whsec_dGVzdC1zZWNyZXQtZm9yLWNvdXJpZXI";

/// Event name used by default fixtures.
pub const TEST_EVENT: &str = "email.delivered";

/// Builder for test subscriptions.
#[derive(Debug, Clone)]
pub struct SubscriptionBuilder {
    url: String,
    auth: AuthConfig,
    timeout_ms: u64,
    max_retries: u32,
    is_active: bool,
    events: Vec<String>,
    tenant_id: Option<TenantId>,
}

impl SubscriptionBuilder {
    /// HMAC-signed subscription to [`TEST_EVENT`] with three retries.
    pub fn with_defaults(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: AuthConfig::Hmac { secret: TEST_SECRET.to_string() },
            timeout_ms: 5_000,
            max_retries: 3,
            is_active: true,
            events: vec![TEST_EVENT.to_string()],
            tenant_id: None,
        }
    }

    /// Sets the authentication scheme.
    #[must_use]
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Replaces the subscribed events.
    #[must_use]
    pub fn events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the subscription disabled.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Sets the owning tenant.
    #[must_use]
    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Builds the subscription with a fresh id.
    pub fn build(self) -> WebhookSubscription {
        WebhookSubscription {
            id: SubscriptionId::new(),
            tenant_id: self.tenant_id.unwrap_or_default(),
            url: self.url,
            auth: self.auth,
            timeout_ms: self.timeout_ms,
            max_retries: self.max_retries,
            is_active: self.is_active,
            events: self.events,
        }
    }
}

/// Representative event payload.
pub fn sample_payload() -> Value {
    json!({
        "email_id": "em_01HZX3",
        "to": ["someone@example.com"],
        "subject": "Welcome aboard",
    })
}
