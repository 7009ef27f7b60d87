//! Payload signatures and per-scheme authentication headers.
//!
//! The timestamped signature covers `"{timestamp}.{payload}"`, where the
//! timestamp is decimal unix seconds and the payload is the exact request
//! body. Receivers recompute it from the `X-Webhook-Timestamp` header and
//! the raw body.

use std::{collections::BTreeMap, time::Duration};

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use courier_core::models::AuthConfig;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the unix timestamp the signature was computed with.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Prefix of generated secrets.
pub const SECRET_PREFIX: &str = "whsec_";

const SIGNATURE_PREFIX: &str = "sha256=";
const SECRET_BYTES: usize = 32;

fn mac_over(secret: &str, parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::internal(format!("hmac key rejected: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// HMAC-SHA256 of `payload` keyed by `secret`, as 64 lowercase hex chars.
///
/// # Errors
///
/// Returns `DeliveryError::InternalError` if the MAC cannot be keyed.
pub fn sign(payload: &[u8], secret: &str) -> Result<String> {
    mac_over(secret, &[payload]).map(hex::encode)
}

/// `sha256=<hex>` over `"{timestamp}.{payload}"`.
///
/// # Errors
///
/// Returns `DeliveryError::InternalError` if the MAC cannot be keyed.
pub fn signature_header(payload: &[u8], secret: &str, timestamp: i64) -> Result<String> {
    let ts = timestamp.to_string();
    let digest = mac_over(secret, &[ts.as_bytes(), b".", payload])?;
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(digest)))
}

fn decode_signature(signature: &str) -> Option<Vec<u8>> {
    let hex_part = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    hex::decode(hex_part.trim()).ok()
}

/// Checks a bare or `sha256=`-prefixed digest produced by [`sign`].
///
/// Comparison is constant time. Malformed input yields `false`.
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Some(provided) = decode_signature(signature) else {
        return false;
    };
    let Ok(expected) = mac_over(secret, &[payload]) else {
        return false;
    };
    provided.ct_eq(&expected).into()
}

/// Receiver-side check of a timestamped signature header.
///
/// Rejects timestamps more than `tolerance` away from `now` so that a
/// captured request cannot be replayed later.
pub fn verify_signature_header(
    payload: &[u8],
    header: &str,
    secret: &str,
    timestamp: i64,
    now: i64,
    tolerance: Duration,
) -> bool {
    if now.abs_diff(timestamp) > tolerance.as_secs() {
        return false;
    }

    let Some(provided) = decode_signature(header) else {
        return false;
    };
    let ts = timestamp.to_string();
    let Ok(expected) = mac_over(secret, &[ts.as_bytes(), b".", payload]) else {
        return false;
    };
    provided.ct_eq(&expected).into()
}

/// Authentication headers for one request.
///
/// An incomplete configuration yields no headers at all. `timestamp`
/// defaults to the current time and only matters for HMAC.
pub fn build_auth_headers(
    auth: &AuthConfig,
    payload: &[u8],
    timestamp: Option<i64>,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    if !auth.is_complete() {
        return headers;
    }

    match auth {
        AuthConfig::None => {},
        AuthConfig::Basic { value } => {
            headers.insert("Authorization".to_string(), format!("Basic {}", STANDARD.encode(value)));
        },
        AuthConfig::Bearer { value } => {
            headers.insert("Authorization".to_string(), format!("Bearer {value}"));
        },
        AuthConfig::ApiKey { header, value } => {
            headers.insert(header.clone(), value.clone());
        },
        AuthConfig::Hmac { secret } => {
            if payload.is_empty() {
                return headers;
            }
            let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
            if let Ok(signature) = signature_header(payload, secret, timestamp) {
                headers.insert(SIGNATURE_HEADER.to_string(), signature);
                headers.insert(TIMESTAMP_HEADER.to_string(), timestamp.to_string());
            }
        },
    }

    headers
}

/// Fresh signing secret: `whsec_` followed by 32 random bytes, base64url.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    format!("{SECRET_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}
