use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use redeem_relay_core::RedemptionEvent;

const TOPIC_BUFFER: usize = 256;

/// A redemption that was stored for its owning local user.
#[derive(Debug, Clone)]
pub struct RoutedRedemption {
    pub user_id: String,
    pub stored_id: String,
    pub event: Arc<RedemptionEvent>,
}

/// A remote subscription whose authorization was withdrawn.
#[derive(Debug, Clone)]
pub struct SubscriptionRevoked {
    pub remote_subscription_id: String,
    pub owners: Vec<String>,
    pub reason: String,
}

/// In-process bus with one typed topic per event kind.
#[derive(Clone)]
pub struct EventBus {
    routed: broadcast::Sender<RoutedRedemption>,
    revoked: broadcast::Sender<SubscriptionRevoked>,
}

impl EventBus {
    pub fn new() -> Self {
        let (routed, _) = broadcast::channel(TOPIC_BUFFER);
        let (revoked, _) = broadcast::channel(TOPIC_BUFFER);
        Self { routed, revoked }
    }

    /// Returns the number of consumers that received the message.
    pub fn publish_routed(&self, message: RoutedRedemption) -> usize {
        let delivered = self.routed.send(message).unwrap_or(0);
        if delivered == 0 {
            debug!(stage = "router", "routed redemption has no consumers");
        }
        delivered
    }

    pub fn subscribe_routed(&self) -> broadcast::Receiver<RoutedRedemption> {
        self.routed.subscribe()
    }

    pub fn publish_revoked(&self, message: SubscriptionRevoked) -> usize {
        let delivered = self.revoked.send(message).unwrap_or(0);
        if delivered == 0 {
            debug!(stage = "registry", "revocation has no consumers");
        }
        delivered
    }

    pub fn subscribe_revoked(&self) -> broadcast::Receiver<SubscriptionRevoked> {
        self.revoked.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::new();
        let mut routed = bus.subscribe_routed();
        let mut revoked = bus.subscribe_revoked();

        let delivered = bus.publish_revoked(SubscriptionRevoked {
            remote_subscription_id: "sub-1".into(),
            owners: vec!["user-1".into()],
            reason: "authorization_revoked".into(),
        });
        assert_eq!(delivered, 1);

        let message = revoked.recv().await.expect("revocation");
        assert_eq!(message.remote_subscription_id, "sub-1");
        assert!(routed.try_recv().is_err());
    }

    #[test]
    fn publishing_without_consumers_is_not_an_error() {
        let bus = EventBus::new();
        let delivered = bus.publish_revoked(SubscriptionRevoked {
            remote_subscription_id: "sub-1".into(),
            owners: Vec::new(),
            reason: "user_removed".into(),
        });
        assert_eq!(delivered, 0);
    }
}
