use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::RedemptionEvent;

/// Subscription type used for channel point redemptions.
pub const REDEMPTION_ADD_TYPE: &str = "channel.channel_points_custom_reward_redemption.add";

/// Errors that can occur while interpreting an inbound EventSub body.
#[derive(Debug, Error)]
pub enum EventSubError {
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing challenge in verification payload")]
    MissingChallenge,
    #[error("missing event block in payload")]
    MissingEvent,
    #[error("unsupported event type: {0}")]
    UnsupportedEventType(String),
}

/// Message kinds announced via the `Twitch-Eventsub-Message-Type` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Verification,
    Notification,
    Revocation,
    Unknown(String),
}

impl MessageKind {
    pub fn from_header(value: &str) -> Self {
        match value {
            "webhook_callback_verification" => Self::Verification,
            "notification" => Self::Notification,
            "revocation" => Self::Revocation,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Returns the label used for metrics and logs.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Verification => "webhook_callback_verification",
            Self::Notification => "notification",
            Self::Revocation => "revocation",
            Self::Unknown(value) => value,
        }
    }

    /// Bounded label for metrics; unknown header values collapse into one series.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::Notification => "notification",
            Self::Revocation => "revocation",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Subscription metadata included with every webhook message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub condition: Value,
    #[serde(default)]
    pub transport: Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Parsed webhook body shared by every message kind.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebhookEnvelope {
    pub subscription: SubscriptionInfo,
    #[serde(default)]
    pub event: Option<Value>,
    #[serde(default)]
    pub challenge: Option<String>,
}

impl WebhookEnvelope {
    pub fn parse(body: &[u8]) -> Result<Self, EventSubError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Returns the handshake challenge that must be echoed back.
    pub fn challenge(&self) -> Result<&str, EventSubError> {
        self.challenge
            .as_deref()
            .ok_or(EventSubError::MissingChallenge)
    }

    /// Decodes the event block of a redemption notification.
    pub fn redemption(&self) -> Result<RedemptionEvent, EventSubError> {
        if self.subscription.kind != REDEMPTION_ADD_TYPE {
            return Err(EventSubError::UnsupportedEventType(
                self.subscription.kind.clone(),
            ));
        }
        let event = self.event.as_ref().ok_or(EventSubError::MissingEvent)?;
        Ok(RedemptionEvent::deserialize(event)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RedemptionStatus;
    use serde_json::json;

    #[test]
    fn parses_verification_challenge() {
        let body = json!({
            "challenge": "pogchamp-kappa-360noscope-vohiyo",
            "subscription": sample_subscription(),
        });
        let envelope = WebhookEnvelope::parse(body.to_string().as_bytes()).expect("parse");

        assert_eq!(
            envelope.challenge().expect("challenge"),
            "pogchamp-kappa-360noscope-vohiyo"
        );
        assert_eq!(envelope.subscription.id, "sub-1");
    }

    #[test]
    fn missing_challenge_is_reported() {
        let body = json!({ "subscription": sample_subscription() });
        let envelope = WebhookEnvelope::parse(body.to_string().as_bytes()).expect("parse");

        assert!(matches!(
            envelope.challenge(),
            Err(EventSubError::MissingChallenge)
        ));
    }

    #[test]
    fn decodes_redemption_notification() {
        let body = json!({
            "subscription": sample_subscription(),
            "event": {
                "id": "evt-1",
                "broadcaster_user_id": "B1",
                "broadcaster_user_login": "caster",
                "broadcaster_user_name": "Caster",
                "user_id": "V1",
                "user_login": "ann",
                "user_name": "Ann",
                "user_input": "hello",
                "status": "unfulfilled",
                "reward": { "id": "R1", "title": "Pause", "cost": 500, "prompt": "" },
                "redeemed_at": "2024-01-01T00:00:00.123Z"
            }
        });
        let envelope = WebhookEnvelope::parse(body.to_string().as_bytes()).expect("parse");
        let event = envelope.redemption().expect("redemption");

        assert_eq!(event.id, "evt-1");
        assert_eq!(event.reward.cost, 500);
        assert_eq!(event.user_input, "hello");
        assert_eq!(event.status, RedemptionStatus::Unfulfilled);
    }

    #[test]
    fn notification_without_event_is_rejected() {
        let body = json!({ "subscription": sample_subscription() });
        let envelope = WebhookEnvelope::parse(body.to_string().as_bytes()).expect("parse");

        assert!(matches!(
            envelope.redemption(),
            Err(EventSubError::MissingEvent)
        ));
    }

    #[test]
    fn other_subscription_types_are_unsupported() {
        let mut subscription = sample_subscription();
        subscription["type"] = json!("stream.online");
        let body = json!({ "subscription": subscription, "event": {} });
        let envelope = WebhookEnvelope::parse(body.to_string().as_bytes()).expect("parse");

        assert!(matches!(
            envelope.redemption(),
            Err(EventSubError::UnsupportedEventType(kind)) if kind == "stream.online"
        ));
    }

    #[test]
    fn message_kind_preserves_unknown_values() {
        assert_eq!(
            MessageKind::from_header("notification"),
            MessageKind::Notification
        );
        let kind = MessageKind::from_header("future_type");
        assert_eq!(kind.as_str(), "future_type");
        assert_eq!(kind.metric_label(), "unknown");
    }

    fn sample_subscription() -> Value {
        json!({
            "id": "sub-1",
            "status": "enabled",
            "type": REDEMPTION_ADD_TYPE,
            "version": "1",
            "condition": { "broadcaster_user_id": "B1", "reward_id": "R1" },
            "transport": { "method": "webhook", "callback": "https://example.com/webhook/twitch" },
            "created_at": "2024-01-01T00:00:00Z"
        })
    }
}
