//! Domain types shared by the storage layer, the Twitch client, and the app.

pub mod eventsub;
pub mod types;

pub use eventsub::{EventSubError, MessageKind, SubscriptionInfo, WebhookEnvelope, REDEMPTION_ADD_TYPE};
pub use types::{
    system_clock, PausePayload, RedemptionEvent, RedemptionStatus, Reward, SharedClock,
    SubscriptionStatus,
};
