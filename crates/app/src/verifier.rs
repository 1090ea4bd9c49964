use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::counter;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use redeem_relay_core::SharedClock;

pub const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
pub const HEADER_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
pub const HEADER_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
pub const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";

/// Largest accepted distance between the message timestamp and now.
const MAX_SKEW_MS: i64 = 10 * 60 * 1000;

/// Headers every EventSub delivery must carry.
#[derive(Debug, Clone, Copy)]
pub struct MessageHeaders<'a> {
    pub message_id: &'a str,
    pub timestamp: &'a str,
    pub message_type: &'a str,
    pub signature: &'a str,
}

impl<'a> MessageHeaders<'a> {
    /// Collects the four required headers; nothing is verified yet.
    pub fn from_headers(headers: &'a HeaderMap) -> Result<Self, VerificationError> {
        Ok(Self {
            message_id: get_required_header(headers, HEADER_MESSAGE_ID)?,
            timestamp: get_required_header(headers, HEADER_TIMESTAMP)?,
            message_type: get_required_header(headers, HEADER_MESSAGE_TYPE)?,
            signature: get_required_header(headers, HEADER_SIGNATURE)?,
        })
    }
}

/// Reasons a delivery is refused before it reaches the dispatcher.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),
    #[error("invalid RFC3339 timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("webhook secret is not configured")]
    SecretNotConfigured,
    #[error("failed to initialize signature verifier")]
    InvalidSecret,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("timestamp outside the allowed ±10 minute window (skew {skew_ms} ms)")]
    StaleTimestamp { skew_ms: i64 },
}

impl VerificationError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingHeader(_) | Self::InvalidTimestamp(_) => StatusCode::BAD_REQUEST,
            Self::SecretNotConfigured
            | Self::InvalidSecret
            | Self::SignatureMismatch
            | Self::StaleTimestamp { .. } => StatusCode::FORBIDDEN,
        }
    }

    pub fn problem_type(&self) -> &'static str {
        match self {
            Self::MissingHeader(_) => "missing_header",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::SecretNotConfigured | Self::InvalidSecret => "verification_unavailable",
            Self::SignatureMismatch => "invalid_signature",
            Self::StaleTimestamp { .. } => "timestamp_out_of_range",
        }
    }
}

/// HMAC verifier for inbound EventSub deliveries.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Option<Arc<[u8]>>,
    clock: SharedClock,
}

impl WebhookVerifier {
    /// Without a secret every delivery is refused.
    pub fn new(secret: Option<Arc<[u8]>>, clock: SharedClock) -> Self {
        Self { secret, clock }
    }

    /// Checks the signature and the replay window. Pure: no state is touched.
    pub fn verify(&self, headers: &MessageHeaders<'_>, body: &[u8]) -> Result<(), VerificationError> {
        let timestamp = parse_timestamp(headers.timestamp)?;
        let secret = self
            .secret
            .as_deref()
            .ok_or(VerificationError::SecretNotConfigured)?;

        let expected = sign(secret, headers.message_id, headers.timestamp, body)?;
        if !bool::from(expected.as_bytes().ct_eq(headers.signature.as_bytes())) {
            counter!("eventsub_invalid_signature_total").increment(1);
            warn!(
                stage = "ingress",
                message_id = headers.message_id,
                "webhook signature mismatch"
            );
            return Err(VerificationError::SignatureMismatch);
        }

        let now = (self.clock)();
        let skew_ms = now.signed_duration_since(timestamp).num_milliseconds().abs();
        if skew_ms > MAX_SKEW_MS {
            warn!(
                stage = "ingress",
                message_id = headers.message_id,
                timestamp = headers.timestamp,
                now = %now.to_rfc3339(),
                skew_ms,
                "timestamp outside ±10 minute window"
            );
            return Err(VerificationError::StaleTimestamp { skew_ms });
        }

        Ok(())
    }
}

/// Computes `sha256=<hex>` over `message_id || timestamp || body`.
pub fn sign(
    secret: &[u8],
    message_id: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<String, VerificationError> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).map_err(|_| VerificationError::InvalidSecret)?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn get_required_header<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<&'a str, VerificationError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or(VerificationError::MissingHeader(name))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, VerificationError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| VerificationError::InvalidTimestamp(err.to_string()))
}
