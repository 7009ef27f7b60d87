//! Core domain models and strongly-typed identifiers.
//!
//! Defines subscriptions, deliveries, queue jobs and the newtype ID wrappers
//! shared by every courier crate. The delivery status state machine lives
//! here so that storage backends and the dispatch engine enforce the same
//! transitions.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Maximum number of characters of a receiver's response body kept on a
/// delivery record.
pub const MAX_RESPONSE_CHARS: usize = 1000;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Owning tenant of a subscription.
    TenantId
);

uuid_id!(
    /// Identifier of a webhook subscription (the receiving endpoint record).
    SubscriptionId
);

uuid_id!(
    /// Identifier of a delivery: one event sent to one subscription until
    /// success or exhaustion.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_core::models::DeliveryId;
    /// let delivery_id = DeliveryId::new();
    /// println!("dispatching delivery {delivery_id}");
    /// ```
    DeliveryId
);

uuid_id!(
    /// Identifier of a single queued attempt.
    JobId
);

/// Authentication scheme configured on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthType {
    /// No authentication headers.
    None,
    /// HTTP basic authentication.
    Basic,
    /// Bearer token.
    Bearer,
    /// Static key in a custom header.
    ApiKey,
    /// Timestamped HMAC-SHA256 signature.
    Hmac,
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Basic => write!(f, "BASIC"),
            Self::Bearer => write!(f, "BEARER"),
            Self::ApiKey => write!(f, "API_KEY"),
            Self::Hmac => write!(f, "HMAC"),
        }
    }
}

impl FromStr for AuthType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::None),
            "BASIC" => Ok(Self::Basic),
            "BEARER" => Ok(Self::Bearer),
            "API_KEY" => Ok(Self::ApiKey),
            "HMAC" => Ok(Self::Hmac),
            other => Err(CoreError::InvalidInput(format!("unknown auth type: {other}"))),
        }
    }
}

/// Authentication material for outbound requests.
///
/// Each scheme carries exactly the fields it needs, so header construction is
/// an exhaustive match rather than a runtime field lookup. Records arriving
/// from the subscription store in loosely-typed form go through
/// [`AuthConfig::from_record`].
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication.
    #[default]
    None,
    /// `Authorization: Basic base64(value)` where value is `user:pass`.
    Basic {
        /// Raw `user:pass` credentials.
        value: String,
    },
    /// `Authorization: Bearer value`.
    Bearer {
        /// Token sent verbatim.
        value: String,
    },
    /// `{header}: {value}`.
    ApiKey {
        /// Header name.
        header: String,
        /// Header value.
        value: String,
    },
    /// Signature headers computed from the request body.
    Hmac {
        /// Shared signing secret.
        secret: String,
    },
}

impl AuthConfig {
    /// Builds the union from the columns of a subscription record.
    ///
    /// Missing columns become empty strings; callers check
    /// [`AuthConfig::is_complete`] before dispatching so an incomplete record
    /// is rejected rather than sent with partial headers.
    pub fn from_record(
        auth_type: AuthType,
        header_name: Option<String>,
        value: Option<String>,
        secret: Option<String>,
    ) -> Self {
        match auth_type {
            AuthType::None => Self::None,
            AuthType::Basic => Self::Basic { value: value.unwrap_or_default() },
            AuthType::Bearer => Self::Bearer { value: value.unwrap_or_default() },
            AuthType::ApiKey => Self::ApiKey {
                header: header_name.unwrap_or_default(),
                value: value.unwrap_or_default(),
            },
            AuthType::Hmac => Self::Hmac { secret: secret.unwrap_or_default() },
        }
    }

    /// Scheme of this configuration.
    pub fn auth_type(&self) -> AuthType {
        match self {
            Self::None => AuthType::None,
            Self::Basic { .. } => AuthType::Basic,
            Self::Bearer { .. } => AuthType::Bearer,
            Self::ApiKey { .. } => AuthType::ApiKey,
            Self::Hmac { .. } => AuthType::Hmac,
        }
    }

    /// True when every field the scheme needs is non-blank.
    pub fn is_complete(&self) -> bool {
        let filled = |s: &str| !s.trim().is_empty();
        match self {
            Self::None => true,
            Self::Basic { value } | Self::Bearer { value } => filled(value),
            Self::ApiKey { header, value } => filled(header) && filled(value),
            Self::Hmac { secret } => filled(secret),
        }
    }
}

// Credentials must never reach log output.
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { .. } => f.debug_struct("Basic").field("value", &"***").finish(),
            Self::Bearer { .. } => f.debug_struct("Bearer").field("value", &"***").finish(),
            Self::ApiKey { header, .. } => {
                f.debug_struct("ApiKey").field("header", header).field("value", &"***").finish()
            },
            Self::Hmac { .. } => f.debug_struct("Hmac").field("secret", &"***").finish(),
        }
    }
}

/// Configuration of a receiving endpoint, owned by the subscription store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Destination URL, re-validated before every dispatch.
    pub url: String,
    /// Authentication scheme and material.
    pub auth: AuthConfig,
    /// Hard timeout for each HTTP attempt.
    pub timeout_ms: u64,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Inactive subscriptions never receive deliveries.
    pub is_active: bool,
    /// Event names this subscription listens to; `*` matches everything.
    pub events: Vec<String>,
}

impl WebhookSubscription {
    /// Whether an event should fan out to this subscription.
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.is_active && self.events.iter().any(|e| e == "*" || e == event)
    }
}

/// Delivery lifecycle status.
///
/// ```text
/// Pending -> Processing -> Delivered
///                       -> Retrying -> Processing
///                       -> Failed
/// ```
///
/// `Delivered` and `Failed` are terminal. `Pending -> Failed` records a
/// delivery whose first job could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, first attempt queued.
    Pending,
    /// A worker holds the job lease and is dispatching.
    Processing,
    /// Last attempt failed, another one is queued.
    Retrying,
    /// Receiver acknowledged with a 2xx.
    Delivered,
    /// Retries exhausted or permanently rejected.
    Failed,
}

impl DeliveryStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 5] =
        [Self::Pending, Self::Processing, Self::Retrying, Self::Delivered, Self::Failed];

    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Processing -> Processing` covers a job reclaimed after its lease
    /// expired mid-attempt.
    pub fn can_transition_to(self, next: Self) -> bool {
        use DeliveryStatus::{Delivered, Failed, Pending, Processing, Retrying};
        matches!(
            (self, next),
            (Pending, Processing | Failed)
                | (Processing, Processing | Delivered | Retrying | Failed)
                | (Retrying, Processing)
        )
    }

    /// Statuses from which `next` may be entered.
    pub fn predecessors(next: Self) -> Vec<Self> {
        Self::ALL.into_iter().filter(|s| s.can_transition_to(next)).collect()
    }

    /// Lowercase name used in storage and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::InvalidInput(format!("invalid delivery status: {s}")))
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

/// One event sent to one subscription, tracked across all of its attempts.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delivery {
    /// Delivery identifier.
    pub id: DeliveryId,
    /// Target subscription.
    pub subscription_id: SubscriptionId,
    /// Event name.
    pub event: String,
    /// Event data, immutable once created.
    pub payload: sqlx::types::Json<serde_json::Value>,
    /// Current lifecycle status.
    pub status: DeliveryStatus,
    /// Attempts made so far; set before each dispatch.
    pub attempts: i32,
    /// HTTP status of the last attempt that got a response.
    pub status_code: Option<i32>,
    /// Truncated body of the last response.
    pub response: Option<String>,
    /// Last failure reason.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Set once on the successful terminal transition.
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Creates a pending delivery with no attempts.
    pub fn new(
        subscription_id: SubscriptionId,
        event: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            subscription_id,
            event: event.into(),
            payload: sqlx::types::Json(payload),
            status: DeliveryStatus::Pending,
            attempts: 0,
            status_code: None,
            response: None,
            error: None,
            created_at: now,
            updated_at: now,
            delivered_at: None,
        }
    }

    /// Applies a status update in memory, enforcing the state machine.
    ///
    /// Storage backends call this (or its SQL equivalent) so every backend
    /// rejects the same transitions.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if the move is not allowed.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<(), CoreError> {
        if !self.status.can_transition_to(update.status) {
            return Err(CoreError::InvalidTransition { from: self.status, to: update.status });
        }

        self.status = update.status;
        if let Some(attempts) = update.attempts {
            self.attempts = i32::try_from(attempts).unwrap_or(i32::MAX);
        }
        if let Some(outcome) = &update.outcome {
            self.status_code = outcome.status_code.map(i32::from);
            self.response.clone_from(&outcome.response);
            self.error.clone_from(&outcome.error);
            if self.delivered_at.is_none() {
                self.delivered_at = outcome.delivered_at;
            }
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Result details of one attempt, written together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// HTTP status, if a response arrived.
    pub status_code: Option<u16>,
    /// Response body, already truncated.
    pub response: Option<String>,
    /// Failure reason; `None` on success.
    pub error: Option<String>,
    /// Success timestamp.
    pub delivered_at: Option<DateTime<Utc>>,
}

/// A requested change of delivery status.
///
/// `outcome: None` leaves the result columns untouched so the last error stays
/// visible while a retry is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Target status.
    pub status: DeliveryStatus,
    /// New attempt count, if it changes.
    pub attempts: Option<u32>,
    /// Result details replacing the stored ones.
    pub outcome: Option<AttemptOutcome>,
}

impl StatusUpdate {
    /// Worker took the job for attempt `attempt`.
    pub fn processing(attempt: u32) -> Self {
        Self { status: DeliveryStatus::Processing, attempts: Some(attempt), outcome: None }
    }

    /// Receiver accepted the delivery.
    pub fn delivered(status_code: u16, response: &str, at: DateTime<Utc>) -> Self {
        Self {
            status: DeliveryStatus::Delivered,
            attempts: None,
            outcome: Some(AttemptOutcome {
                status_code: Some(status_code),
                response: Some(truncate_response(response)),
                error: None,
                delivered_at: Some(at),
            }),
        }
    }

    /// Attempt failed and another one will follow.
    pub fn retrying(error: impl Into<String>, status_code: Option<u16>, response: Option<&str>) -> Self {
        Self::failure(DeliveryStatus::Retrying, error.into(), status_code, response)
    }

    /// Attempt failed and no further attempt will be made.
    pub fn failed(error: impl Into<String>, status_code: Option<u16>, response: Option<&str>) -> Self {
        Self::failure(DeliveryStatus::Failed, error.into(), status_code, response)
    }

    fn failure(
        status: DeliveryStatus,
        error: String,
        status_code: Option<u16>,
        response: Option<&str>,
    ) -> Self {
        Self {
            status,
            attempts: None,
            outcome: Some(AttemptOutcome {
                status_code,
                response: response.map(truncate_response),
                error: Some(truncate_response(&error)),
                delivered_at: None,
            }),
        }
    }
}

/// Truncates a response body to [`MAX_RESPONSE_CHARS`] characters.
pub fn truncate_response(body: &str) -> String {
    match body.char_indices().nth(MAX_RESPONSE_CHARS) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body.to_string(),
    }
}

/// Exact JSON body received by the third-party endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Event name.
    pub event: String,
    /// Event data.
    pub data: serde_json::Value,
    /// Creation time of this delivery cycle, RFC 3339.
    pub timestamp: DateTime<Utc>,
}

impl WebhookEnvelope {
    /// Wraps a delivery's event for sending.
    pub fn for_delivery(delivery: &Delivery, timestamp: DateTime<Utc>) -> Self {
        Self { event: delivery.event.clone(), data: delivery.payload.0.clone(), timestamp }
    }

    /// Serializes the envelope to the bytes that are signed and sent.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the data cannot be serialized.
    pub fn to_body(&self) -> Result<String, CoreError> {
        serde_json::to_string(self)
            .map_err(|e| CoreError::InvalidInput(format!("unserializable payload: {e}")))
    }
}

/// Self-contained snapshot of everything one attempt needs.
///
/// Workers dispatch from the job alone, without reading the subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Delivery this attempt belongs to.
    pub delivery_id: DeliveryId,
    /// Subscription being notified.
    pub subscription_id: SubscriptionId,
    /// Event name, sent as a correlation header.
    pub event: String,
    /// Destination URL.
    pub url: String,
    /// Serialized envelope; identical across all attempts of one cycle.
    pub body: String,
    /// Authentication material.
    pub auth: AuthConfig,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl DeliveryJob {
    /// Builds the first attempt of a delivery cycle.
    pub fn first_attempt(
        delivery: &Delivery,
        subscription: &WebhookSubscription,
        body: String,
    ) -> Self {
        Self {
            delivery_id: delivery.id,
            subscription_id: subscription.id,
            event: delivery.event.clone(),
            url: subscription.url.clone(),
            body,
            auth: subscription.auth.clone(),
            timeout_ms: subscription.timeout_ms,
            max_retries: subscription.max_retries,
            attempt: 1,
        }
    }

    /// Same job, next attempt number.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self { attempt: self.attempt.saturating_add(1), ..self.clone() }
    }

    /// Per-attempt timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Per-status counts for one subscription over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Deliveries created in the window.
    pub total: u64,
    /// Delivered.
    pub delivered: u64,
    /// Permanently failed.
    pub failed: u64,
    /// Waiting for the first attempt.
    pub pending: u64,
    /// Currently being dispatched.
    pub processing: u64,
    /// Waiting for a retry.
    pub retrying: u64,
    /// Delivered share of total, in percent with two decimals.
    pub success_rate: f64,
}

impl DeliveryStats {
    /// Builds stats from `(status, count)` pairs.
    pub fn from_counts(counts: impl IntoIterator<Item = (DeliveryStatus, u64)>) -> Self {
        let mut stats = Self::default();
        for (status, count) in counts {
            match status {
                DeliveryStatus::Pending => stats.pending += count,
                DeliveryStatus::Processing => stats.processing += count,
                DeliveryStatus::Retrying => stats.retrying += count,
                DeliveryStatus::Delivered => stats.delivered += count,
                DeliveryStatus::Failed => stats.failed += count,
            }
            stats.total += count;
        }
        if stats.total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let rate = stats.delivered as f64 / stats.total as f64 * 100.0;
            stats.success_rate = (rate * 100.0).round() / 100.0;
        }
        stats
    }
}
