use std::{
    collections::HashMap,
    convert::Infallible,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use axum::response::sse::Event;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, mpsc::error::TrySendError};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use redeem_relay_core::PausePayload;

use crate::bus::{EventBus, RoutedRedemption, SubscriptionRevoked};

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_PAUSE: &str = "pause";
pub const EVENT_SUBSCRIPTION_REVOKED: &str = "subscription_revoked";

const CONNECTION_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct LiveMessage {
    event: &'static str,
    data: Arc<str>,
}

impl LiveMessage {
    fn to_event(&self) -> Event {
        Event::default().event(self.event).data(self.data.as_ref())
    }
}

/// Per-user registry of open live connections.
#[derive(Clone, Default)]
pub struct LiveHub {
    connections: Arc<DashMap<String, HashMap<Uuid, mpsc::Sender<LiveMessage>>>>,
    total: Arc<AtomicUsize>,
}

impl LiveHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection for `user_id`. Dropping the returned value
    /// unregisters it.
    pub fn subscribe(&self, user_id: &str) -> LiveConnection {
        let (sender, receiver) = mpsc::channel(CONNECTION_BUFFER);
        let id = Uuid::new_v4();
        self.connections
            .entry(user_id.to_string())
            .or_default()
            .insert(id, sender);
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("live_connections").set(total as f64);
        info!(stage = "live", user_id, connection_id = %id, "live connection opened");

        LiveConnection {
            user_id: user_id.to_string(),
            receiver,
            guard: ConnectionGuard {
                hub: self.clone(),
                user_id: user_id.to_string(),
                id,
            },
        }
    }

    /// Unregisters one connection. Returns `false` when it was already gone.
    pub fn remove(&self, user_id: &str, connection_id: Uuid) -> bool {
        let removed = match self.connections.get_mut(user_id) {
            Some(mut entry) => entry.remove(&connection_id).is_some(),
            None => false,
        };
        if !removed {
            return false;
        }

        self.connections
            .remove_if(user_id, |_, connections| connections.is_empty());
        let total = self
            .total
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        gauge!("live_connections").set(total as f64);
        info!(stage = "live", user_id, connection_id = %connection_id, "live connection closed");
        true
    }

    /// Writes a tagged event to every connection of `user_id`.
    ///
    /// Delivery is best-effort per connection; returns how many accepted it.
    pub fn publish<T: Serialize>(
        &self,
        user_id: &str,
        event_type: &'static str,
        payload: &T,
    ) -> Result<usize, LiveError> {
        let message = LiveMessage {
            event: event_type,
            data: Arc::from(serde_json::to_string(payload)?),
        };

        let targets: Vec<(Uuid, mpsc::Sender<LiveMessage>)> = match self.connections.get(user_id) {
            Some(entry) => entry
                .iter()
                .map(|(id, sender)| (*id, sender.clone()))
                .collect(),
            None => Vec::new(),
        };
        if targets.is_empty() {
            debug!(stage = "live", user_id, event_type, "no live connections for user");
            return Ok(0);
        }

        let mut delivered = 0;
        for (id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(stage = "live", user_id, connection_id = %id, event_type, "live connection is lagging; event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    self.remove(user_id, id);
                }
            }
        }

        counter!("live_events_published_total", "type" => event_type).increment(1);
        info!(stage = "live", user_id, event_type, delivered, "live event published");
        Ok(delivered)
    }

    pub fn stats(&self) -> LiveStats {
        let mut connections: Vec<UserConnections> = self
            .connections
            .iter()
            .map(|entry| UserConnections {
                user_id: entry.key().clone(),
                connection_count: entry.value().len(),
            })
            .collect();
        connections.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        LiveStats {
            total_users: connections.len(),
            connections,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LiveStats {
    pub total_users: usize,
    pub connections: Vec<UserConnections>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserConnections {
    pub user_id: String,
    pub connection_count: usize,
}

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("failed to serialize live payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct LiveConnection {
    user_id: String,
    receiver: mpsc::Receiver<LiveMessage>,
    guard: ConnectionGuard,
}

impl LiveConnection {
    /// Turns the connection into an SSE stream that opens with `connected`.
    pub fn into_stream(self) -> LiveStream {
        let greeting = Event::default()
            .event(EVENT_CONNECTED)
            .data(json!({ "userId": self.user_id }).to_string());
        let stream = tokio_stream::once(Ok::<_, Infallible>(greeting)).chain(
            ReceiverStream::new(self.receiver).map(|message| Ok(message.to_event())),
        );
        LiveStream {
            inner: Box::pin(stream),
            _guard: self.guard,
        }
    }

    #[cfg(test)]
    pub(crate) async fn recv(&mut self) -> Option<LiveMessage> {
        self.receiver.recv().await
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<LiveMessage> {
        self.receiver.try_recv().ok()
    }
}

pub struct LiveStream {
    inner: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>,
    _guard: ConnectionGuard,
}

impl Stream for LiveStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner.as_mut().poll_next(cx)
    }
}

struct ConnectionGuard {
    hub: LiveHub,
    user_id: String,
    id: Uuid,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.remove(&self.user_id, self.id);
    }
}

/// Pushes a routed redemption to its owner as a `pause` event.
pub fn handle_routed(hub: &LiveHub, message: &RoutedRedemption) -> Result<usize, LiveError> {
    let payload = PausePayload::from(message.event.as_ref());
    debug!(stage = "live", user_id = %message.user_id, stored_id = %message.stored_id, "forwarding routed redemption");
    hub.publish(&message.user_id, EVENT_PAUSE, &payload)
}

/// Tells every owner of a revoked subscription about it.
pub fn handle_revoked(hub: &LiveHub, message: &SubscriptionRevoked) -> Result<usize, LiveError> {
    let payload = json!({
        "subscriptionId": message.remote_subscription_id,
        "reason": message.reason,
    });
    let mut delivered = 0;
    for owner in &message.owners {
        delivered += hub.publish(owner, EVENT_SUBSCRIPTION_REVOKED, &payload)?;
    }
    Ok(delivered)
}

/// Forwards bus traffic to live connections until `shutdown` fires.
pub fn spawn_bridge(
    hub: LiveHub,
    bus: &EventBus,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut routed = bus.subscribe_routed();
    let mut revoked = bus.subscribe_revoked();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = routed.recv() => match message {
                    Ok(message) => {
                        if let Err(err) = handle_routed(&hub, &message) {
                            warn!(stage = "live", error = %err, user_id = %message.user_id, "failed to publish pause event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(stage = "live", skipped, "live bridge lagged behind routed redemptions");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                message = revoked.recv() => match message {
                    Ok(message) => {
                        if let Err(err) = handle_revoked(&hub, &message) {
                            warn!(stage = "live", error = %err, subscription_id = %message.remote_subscription_id, "failed to publish revocation event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(stage = "live", skipped, "live bridge lagged behind revocations");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!(stage = "live", "live bridge stopped");
    })
}

#[cfg(test)]
impl LiveHub {
    pub(crate) fn connection_count(&self, user_id: &str) -> usize {
        self.connections
            .get(user_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
impl LiveMessage {
    pub(crate) fn event_type(&self) -> &'static str {
        self.event
    }

    pub(crate) fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).expect("live payload is json")
    }
}
