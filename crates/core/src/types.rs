use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Clock abstraction shared by components that need deterministic time in tests.
pub type SharedClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Returns a [`SharedClock`] backed by the system clock.
pub fn system_clock() -> SharedClock {
    Arc::new(Utc::now)
}

/// Lifecycle status of an EventSub subscription as tracked locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    Pending,
    Enabled,
    AuthorizationRevoked,
    NotFoundOnRemote,
    /// Remote status string without a local meaning, preserved verbatim.
    Other(String),
}

impl SubscriptionStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Enabled => "enabled",
            Self::AuthorizationRevoked => "authorization_revoked",
            Self::NotFoundOnRemote => "not_found_on_remote",
            Self::Other(value) => value,
        }
    }

    /// Maps a Helix subscription status onto the local status set.
    pub fn from_remote(value: &str) -> Self {
        match value {
            "enabled" => Self::Enabled,
            "webhook_callback_verification_pending" => Self::Pending,
            "authorization_revoked" | "user_removed" | "moderator_removed" => {
                Self::AuthorizationRevoked
            }
            other => Self::from_stored(other),
        }
    }

    /// Parses a status previously written with [`SubscriptionStatus::as_str`].
    pub fn from_stored(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "enabled" => Self::Enabled,
            "authorization_revoked" => Self::AuthorizationRevoked,
            "not_found_on_remote" => Self::NotFoundOnRemote,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SubscriptionStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SubscriptionStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from_stored(&value))
    }
}

/// Redemption status values emitted by Twitch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionStatus {
    Unfulfilled,
    Fulfilled,
    Canceled,
    Unknown(String),
}

impl RedemptionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unfulfilled => "unfulfilled",
            Self::Fulfilled => "fulfilled",
            Self::Canceled => "canceled",
            Self::Unknown(value) => value,
        }
    }
}

impl FromStr for RedemptionStatus {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.to_ascii_lowercase().as_str() {
            "unfulfilled" => Self::Unfulfilled,
            "fulfilled" => Self::Fulfilled,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Unknown(value.to_string()),
        })
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RedemptionStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RedemptionStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse()
            .map_err(|_| D::Error::custom("unparseable redemption status"))
    }
}

/// Twitch reward metadata attached to a redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    pub id: String,
    pub title: String,
    pub cost: i64,
    #[serde(default)]
    pub prompt: String,
}

/// `channel.channel_points_custom_reward_redemption.add` event body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionEvent {
    pub id: String,
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    pub broadcaster_user_name: String,
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub user_input: String,
    pub status: RedemptionStatus,
    pub reward: Reward,
    pub redeemed_at: DateTime<Utc>,
}

/// Payload pushed to live clients when a redemption is routed to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausePayload {
    pub reward_id: String,
    pub reward_title: String,
    pub viewer_name: String,
    pub cost: i64,
    pub timestamp: DateTime<Utc>,
}

impl From<&RedemptionEvent> for PausePayload {
    fn from(event: &RedemptionEvent) -> Self {
        Self {
            reward_id: event.reward.id.clone(),
            reward_title: event.reward.title.clone(),
            viewer_name: event.user_name.clone(),
            cost: event.reward.cost,
            timestamp: event.redeemed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_statuses_map_onto_local_set() {
        assert_eq!(
            SubscriptionStatus::from_remote("enabled"),
            SubscriptionStatus::Enabled
        );
        assert_eq!(
            SubscriptionStatus::from_remote("webhook_callback_verification_pending"),
            SubscriptionStatus::Pending
        );
        for revoked in ["authorization_revoked", "user_removed", "moderator_removed"] {
            assert_eq!(
                SubscriptionStatus::from_remote(revoked),
                SubscriptionStatus::AuthorizationRevoked
            );
        }
        assert_eq!(
            SubscriptionStatus::from_remote("notification_failures_exceeded"),
            SubscriptionStatus::Other("notification_failures_exceeded".into())
        );
    }

    #[test]
    fn stored_status_round_trips_through_strings() {
        let status = SubscriptionStatus::from_stored("not_found_on_remote");
        assert_eq!(status, SubscriptionStatus::NotFoundOnRemote);
        assert_eq!(status.as_str(), "not_found_on_remote");
        assert_eq!(json!(status), json!("not_found_on_remote"));
    }

    #[test]
    fn redemption_status_tolerates_unknown_values() {
        let status: RedemptionStatus = serde_json::from_value(json!("UNFULFILLED")).unwrap();
        assert_eq!(status, RedemptionStatus::Unfulfilled);

        let status: RedemptionStatus = serde_json::from_value(json!("on_hold")).unwrap();
        assert_eq!(status, RedemptionStatus::Unknown("on_hold".into()));
    }

    #[test]
    fn pause_payload_uses_camel_case_fields() {
        let event: RedemptionEvent = serde_json::from_value(json!({
            "id": "evt-1",
            "broadcaster_user_id": "B1",
            "broadcaster_user_login": "caster",
            "broadcaster_user_name": "Caster",
            "user_id": "V1",
            "user_login": "ann",
            "user_name": "Ann",
            "user_input": "",
            "status": "unfulfilled",
            "reward": { "id": "R1", "title": "Pause", "cost": 500, "prompt": "" },
            "redeemed_at": "2024-01-01T00:00:00Z"
        }))
        .expect("event parses");

        let value = serde_json::to_value(PausePayload::from(&event)).unwrap();
        assert_eq!(value["rewardId"], "R1");
        assert_eq!(value["rewardTitle"], "Pause");
        assert_eq!(value["viewerName"], "Ann");
        assert_eq!(value["cost"], 500);
        assert_eq!(value["timestamp"], "2024-01-01T00:00:00Z");
    }
}
