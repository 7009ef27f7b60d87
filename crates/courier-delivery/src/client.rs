//! HTTP client for webhook delivery.
//!
//! Handles request construction, response processing and error
//! categorization for the retry scheduler. Name resolution goes through
//! [`GuardedResolver`] and every redirect hop is re-checked, so a target that
//! passed validation cannot be swapped for an internal one mid-request.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use bytes::Bytes;
use courier_core::models::{DeliveryId, DeliveryJob, SubscriptionId};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    redirect, Response,
};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    guard::{BlockedTarget, GuardConfig, GuardedResolver, TargetValidator},
};

/// Largest response body read from a receiver.
const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

/// Header naming the subscription a request belongs to.
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-Id";
/// Header naming the delivery.
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Delivery-Id";
/// Header naming the event.
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Fallback timeout for requests that do not carry their own.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// SSRF guard settings for resolution and redirects.
    #[serde(skip)]
    pub guard: GuardConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Courier-Webhooks/1.0".to_string(),
            max_redirects: 0,
            verify_tls: true,
            guard: GuardConfig::default(),
        }
    }
}

/// HTTP client for webhook delivery.
///
/// Pools connections across deliveries; the per-request timeout aborts the
/// request future, which drops the connection instead of leaving it behind.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One outbound attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery being attempted.
    pub delivery_id: DeliveryId,
    /// Subscription being notified.
    pub subscription_id: SubscriptionId,
    /// Event name.
    pub event: String,
    /// Destination URL.
    pub url: String,
    /// Authentication headers.
    pub headers: BTreeMap<String, String>,
    /// Exact bytes that were signed.
    pub body: Bytes,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Hard timeout for the whole exchange.
    pub timeout: Duration,
}

impl DeliveryRequest {
    /// Builds the request for a queued attempt.
    pub fn from_job(job: &DeliveryJob, auth_headers: BTreeMap<String, String>) -> Self {
        Self {
            delivery_id: job.delivery_id,
            subscription_id: job.subscription_id,
            event: job.event.clone(),
            url: job.url.clone(),
            headers: auth_headers,
            body: Bytes::from(job.body.clone()),
            attempt: job.attempt,
            timeout: job.timeout(),
        }
    }
}

/// Response from a webhook delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers, lowercase names.
    pub headers: HashMap<String, String>,
    /// Response body, capped in size.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryResponse {
    /// Failure carried by a non-2xx response.
    pub fn error(&self) -> Option<DeliveryError> {
        if self.is_success {
            return None;
        }
        Some(DeliveryError::from_status(
            self.status_code,
            self.body.clone(),
            extract_retry_after_seconds(&self.headers),
        ))
    }
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(redirect_policy(config.max_redirects, config.guard.clone()))
            .dns_resolver(GuardedResolver::shared(config.guard.clone()))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Client settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs one attempt.
    ///
    /// Any response, whatever its status, is returned as `Ok`; the caller
    /// classifies it with [`DeliveryResponse::error`].
    ///
    /// # Errors
    ///
    /// - `Timeout` when the request timeout elapses
    /// - `UnsafeTarget` when resolution or a redirect reaches a blocked address
    /// - `NetworkError` for every other transport failure
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            subscription_id = %request.subscription_id,
            event = %request.event,
            attempt = request.attempt
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let custom_headers = custom_headers(&request.headers)?;

            let http_request = self
                .client
                .post(&request.url)
                .timeout(request.timeout)
                .body(request.body.clone())
                .header("content-type", "application/json")
                .headers(custom_headers)
                .header(WEBHOOK_ID_HEADER, request.subscription_id.to_string())
                .header(DELIVERY_ID_HEADER, request.delivery_id.to_string())
                .header(EVENT_HEADER, &request.event)
                .header(ATTEMPT_HEADER, request.attempt.to_string());

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(
                        duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "request failed"
                    );
                    return Err(classify_transport_error(&e, request.timeout));
                },
            };

            let duration = start_time.elapsed();
            let delivery_response = self.parse_response(response, duration, &request).await?;

            if delivery_response.is_success {
                tracing::info!(status_code = delivery_response.status_code, "webhook delivered");
            } else {
                tracing::warn!(
                    status_code = delivery_response.status_code,
                    "receiver rejected webhook"
                );
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    async fn parse_response(
        &self,
        mut response: Response,
        duration: Duration,
        request: &DeliveryRequest,
    ) -> Result<DeliveryResponse> {
        let status_code = response.status().as_u16();
        let is_success = response.status().is_success();
        let headers = extract_headers(response.headers());

        let mut bytes: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = MAX_RESPONSE_BODY_SIZE - bytes.len();
                    bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
                    if bytes.len() >= MAX_RESPONSE_BODY_SIZE {
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) if e.is_timeout() => {
                    return Err(DeliveryError::timeout(request.timeout));
                },
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read response body");
                    break;
                },
            }
        }

        let body = String::from_utf8_lossy(&bytes).into_owned();
        Ok(DeliveryResponse { status_code, headers, body, duration, is_success })
    }
}

fn redirect_policy(max_redirects: u32, guard: GuardConfig) -> redirect::Policy {
    let validator = TargetValidator::new(guard);
    let limit = usize::try_from(max_redirects).unwrap_or(usize::MAX);
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > limit {
            return attempt.stop();
        }
        let verdict = validator.check_static_url(attempt.url());
        if verdict.safe {
            attempt.follow()
        } else {
            let reason = verdict.reason.unwrap_or_else(|| "redirect target blocked".to_string());
            attempt.error(BlockedTarget(reason))
        }
    })
}

fn classify_transport_error(error: &reqwest::Error, timeout: Duration) -> DeliveryError {
    if let Some(blocked) = find_blocked_target(error) {
        return DeliveryError::unsafe_target(blocked.0.clone());
    }
    if error.is_timeout() {
        return DeliveryError::timeout(timeout);
    }
    if error.is_connect() {
        return DeliveryError::network(format!("connection failed: {error}"));
    }
    DeliveryError::network(error.to_string())
}

fn find_blocked_target(error: &reqwest::Error) -> Option<&BlockedTarget> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = source {
        if let Some(blocked) = err.downcast_ref::<BlockedTarget>() {
            return Some(blocked);
        }
        source = err.source();
    }
    None
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }

    headers
}

/// Headers the client sets itself; auth headers cannot override them.
/// Converts subscription-supplied headers, skipping the ones the client
/// manages itself.
///
/// # Errors
///
/// Returns `InvalidAuth` if a name or value is not a legal HTTP header. The
/// value is left out of the message since it usually holds a credential.
fn custom_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        if is_managed_header(key) {
            continue;
        }
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| DeliveryError::invalid_auth(format!("invalid header name: {key:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| DeliveryError::invalid_auth(format!("invalid value for header {key}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "x-webhook-id"
            | "x-webhook-delivery-id"
            | "x-webhook-event"
            | "x-webhook-attempt"
    )
}

/// Reads a Retry-After header as seconds.
///
/// Accepts delta-seconds and HTTP-dates. A present but unparseable value
/// yields 60 seconds; a date in the past yields zero.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let retry_after = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;
    let retry_after = retry_after.trim();

    if let Ok(seconds) = retry_after.parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let wait = date_time.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return Some(wait.to_std().map_or(0, |d| d.as_secs()));
    }

    Some(DEFAULT_RETRY_AFTER)
}
