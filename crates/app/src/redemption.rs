use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use redeem_relay_core::{RedemptionEvent, SharedClock, SubscriptionStatus};
use redeem_relay_storage::{
    Database, NewRedemption, RedemptionError, RedemptionRecord, RedemptionUpsertOutcome,
    SubscriptionError,
};

use crate::bus::{EventBus, RoutedRedemption};

pub const DEFAULT_RECENT_LIMIT: u32 = 50;
pub const MAX_RECENT_LIMIT: u32 = 100;

/// Maps redemptions to the local user owning the matching enabled subscription.
#[derive(Clone)]
pub struct RedemptionRouter {
    database: Database,
    bus: EventBus,
    clock: SharedClock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No enabled subscription matched; nothing was stored.
    Unowned,
    Stored {
        user_id: String,
        outcome: RedemptionUpsertOutcome,
    },
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("failed to look up owning subscription: {0}")]
    Subscription(#[from] SubscriptionError),
    #[error("failed to store redemption: {0}")]
    Redemption(#[from] RedemptionError),
    #[error("redemption queue is full")]
    QueueFull,
    #[error("redemption queue is closed")]
    QueueClosed,
}

impl RedemptionRouter {
    pub fn new(database: Database, bus: EventBus, clock: SharedClock) -> Self {
        Self {
            database,
            bus,
            clock,
        }
    }

    /// Persists `event` for its owner and announces first insertions on the bus.
    pub async fn route(&self, event: &RedemptionEvent) -> Result<RouteOutcome, RouteError> {
        let owner = self
            .database
            .subscriptions()
            .find_enabled_owner(&event.broadcaster_user_id, &event.reward.id)
            .await?;
        let Some(owner) = owner else {
            counter!("redemptions_routed_total", "result" => "unowned").increment(1);
            warn!(
                stage = "router",
                broadcaster_id = %event.broadcaster_user_id,
                reward_id = %event.reward.id,
                "no enabled subscription for redemption"
            );
            return Ok(RouteOutcome::Unowned);
        };

        let outcome = self
            .database
            .redemptions()
            .upsert(&NewRedemption {
                user_id: &owner.user_id,
                event,
                processed_at: (self.clock)(),
            })
            .await?;
        counter!("redemptions_routed_total", "result" => outcome.as_str()).increment(1);

        match &outcome {
            RedemptionUpsertOutcome::Inserted { id } => {
                info!(
                    stage = "router",
                    user_id = %owner.user_id,
                    redemption_id = %event.id,
                    viewer = %event.user_name,
                    reward = %event.reward.title,
                    "redemption stored"
                );
                self.bus.publish_routed(RoutedRedemption {
                    user_id: owner.user_id.clone(),
                    stored_id: id.clone(),
                    event: Arc::new(event.clone()),
                });
            }
            RedemptionUpsertOutcome::StatusUpdated { .. } => {
                info!(
                    stage = "router",
                    redemption_id = %event.id,
                    status = %event.status.as_str(),
                    "redemption status updated"
                );
            }
            RedemptionUpsertOutcome::Unchanged => {
                debug!(stage = "router", redemption_id = %event.id, "redemption already stored");
            }
        }

        Ok(RouteOutcome::Stored {
            user_id: owner.user_id,
            outcome,
        })
    }

    /// Promotes a subscription Twitch reports as enabled. Returns `true` when
    /// the stored status changed.
    pub async fn mark_enabled(&self, remote_subscription_id: &str) -> Result<bool, RouteError> {
        let changed = self
            .database
            .subscriptions()
            .sync_status(remote_subscription_id, &SubscriptionStatus::Enabled, (self.clock)())
            .await?;
        if changed > 0 {
            info!(
                stage = "router",
                subscription_id = remote_subscription_id,
                "subscription enabled by notification"
            );
        }
        Ok(changed > 0)
    }

    /// Recent redemptions for `user_id`, newest first.
    pub async fn recent(
        &self,
        user_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<RedemptionRecord>, RouteError> {
        let limit = limit
            .unwrap_or(DEFAULT_RECENT_LIMIT)
            .clamp(1, MAX_RECENT_LIMIT);
        Ok(self.database.redemptions().list_recent(user_id, limit).await?)
    }
}

/// A notification waiting for the worker.
#[derive(Debug, Clone)]
pub struct QueuedRedemption {
    pub event: RedemptionEvent,
    /// Remote subscription to mark enabled before routing.
    pub enabled_subscription: Option<String>,
}

/// Hands redemptions to the routing worker without waiting for storage.
#[derive(Clone)]
pub struct RedemptionQueue {
    sender: mpsc::Sender<QueuedRedemption>,
}

impl RedemptionQueue {
    pub fn new(router: RedemptionRouter, capacity: usize) -> (Self, RedemptionWorker) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, RedemptionWorker { router, receiver })
    }

    pub fn enqueue(&self, job: QueuedRedemption) -> Result<(), RouteError> {
        self.sender.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RouteError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RouteError::QueueClosed,
        })
    }
}

pub struct RedemptionWorker {
    router: RedemptionRouter,
    receiver: mpsc::Receiver<QueuedRedemption>,
}

impl RedemptionWorker {
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(job) = self.receiver.recv() => self.process(job).await,
                else => break,
            }
        }
        debug!(stage = "router", "redemption worker stopped");
    }

    async fn process(&self, job: QueuedRedemption) {
        if let Some(subscription_id) = job.enabled_subscription.as_deref() {
            if let Err(err) = self.router.mark_enabled(subscription_id).await {
                warn!(stage = "router", subscription_id, error = %err, "failed to enable subscription");
            }
        }
        if let Err(err) = self.router.route(&job.event).await {
            counter!("redemptions_routed_total", "result" => "error").increment(1);
            error!(stage = "router", redemption_id = %job.event.id, error = %err, "failed to route redemption");
        }
    }
}
