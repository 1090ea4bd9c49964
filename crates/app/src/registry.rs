use metrics::counter;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use redeem_relay_core::{SharedClock, SubscriptionStatus, REDEMPTION_ADD_TYPE};
use redeem_relay_storage::{
    AccountError, Database, LinkedAccount, NewSubscription, SubscriptionError, SubscriptionRecord,
    TWITCH_PROVIDER,
};
use redeem_relay_twitch::{CreateSubscriptionRequest, HelixClient, HelixError};
use redeem_relay_util::EventSubConfig;

const SUBSCRIPTION_VERSION: &str = "1";

/// Durable mapping of local users to their Twitch EventSub subscriptions.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    database: Database,
    helix: HelixClient,
    eventsub: EventSubConfig,
    clock: SharedClock,
}

#[derive(Debug, Clone)]
pub struct SubscribeOutcome {
    pub subscription: SubscriptionRecord,
    /// `false` when an enabled subscription already existed.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub remote_total: usize,
    pub updated: u64,
    pub marked_missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinkedIdentity {
    pub twitch_user_id: String,
    pub twitch_username: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("server not configured for EventSub (missing callback URL or secret)")]
    NotConfigured,
    #[error("user does not have a linked Twitch account")]
    NoLinkedAccount,
    #[error("subscription not found")]
    NotFound,
    #[error("twitch api error: {0}")]
    Remote(#[from] HelixError),
    #[error("subscription storage error: {0}")]
    Subscription(#[from] SubscriptionError),
    #[error("account storage error: {0}")]
    Account(#[from] AccountError),
}

impl SubscriptionRegistry {
    pub fn new(
        database: Database,
        helix: HelixClient,
        eventsub: EventSubConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            database,
            helix,
            eventsub,
            clock,
        }
    }

    /// Creates the remote subscription for `(user_id, reward_id)` unless an
    /// enabled one already exists.
    pub async fn subscribe(
        &self,
        user_id: &str,
        reward_id: &str,
    ) -> Result<SubscribeOutcome, RegistryError> {
        let (Some(callback), Some(secret)) =
            (self.eventsub.callback_url.as_ref(), self.eventsub.secret.as_deref())
        else {
            return Err(RegistryError::NotConfigured);
        };

        let account = self
            .database
            .accounts()
            .find(user_id, TWITCH_PROVIDER)
            .await?
            .ok_or(RegistryError::NoLinkedAccount)?;

        let subscriptions = self.database.subscriptions();
        if let Some(existing) = subscriptions.find_for_user_reward(user_id, reward_id).await? {
            if existing.status == SubscriptionStatus::Enabled {
                info!(
                    stage = "registry",
                    user_id,
                    reward_id,
                    subscription_id = %existing.twitch_subscription_id,
                    "subscription already enabled"
                );
                return Ok(SubscribeOutcome {
                    subscription: existing,
                    created: false,
                });
            }
        }

        let condition = json!({
            "broadcaster_user_id": account.account_id,
            "reward_id": reward_id,
        });
        let remote = self
            .helix
            .create_subscription(&CreateSubscriptionRequest {
                kind: REDEMPTION_ADD_TYPE,
                version: SUBSCRIPTION_VERSION,
                condition: &condition,
                callback,
                secret,
            })
            .await
            .inspect_err(|err| {
                warn!(stage = "registry", user_id, reward_id, error = %err, "failed to create remote subscription");
            })?;

        let status = SubscriptionStatus::from_remote(&remote.status);
        let record = subscriptions
            .upsert(&NewSubscription {
                user_id,
                twitch_subscription_id: &remote.id,
                broadcaster_id: &account.account_id,
                reward_id,
                status: &status,
                updated_at: (self.clock)(),
            })
            .await?;

        info!(
            stage = "registry",
            user_id,
            reward_id,
            subscription_id = %record.twitch_subscription_id,
            status = %record.status,
            "subscription created"
        );
        Ok(SubscribeOutcome {
            subscription: record,
            created: true,
        })
    }

    /// Deletes the remote subscription first; the local record only goes away
    /// once Twitch no longer has it.
    pub async fn unsubscribe(&self, user_id: &str, reward_id: &str) -> Result<(), RegistryError> {
        let subscriptions = self.database.subscriptions();
        let record = subscriptions
            .find_for_user_reward(user_id, reward_id)
            .await?
            .ok_or(RegistryError::NotFound)?;

        match self
            .helix
            .delete_subscription(&record.twitch_subscription_id)
            .await
        {
            Ok(()) => {}
            Err(HelixError::Status { status, .. }) if status == StatusCode::NOT_FOUND => {
                info!(
                    stage = "registry",
                    subscription_id = %record.twitch_subscription_id,
                    "remote subscription already gone"
                );
            }
            Err(err) => {
                warn!(stage = "registry", user_id, reward_id, error = %err, "failed to delete remote subscription");
                return Err(err.into());
            }
        }

        subscriptions.delete(user_id, reward_id).await?;
        info!(stage = "registry", user_id, reward_id, "subscription deleted");
        Ok(())
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<SubscriptionRecord>, RegistryError> {
        Ok(self.database.subscriptions().list_for_user(user_id).await?)
    }

    /// Unconditionally writes `status` to every record with the remote id.
    pub async fn update_status(
        &self,
        remote_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> Result<(), RegistryError> {
        let affected = self
            .database
            .subscriptions()
            .update_status(remote_subscription_id, &status, (self.clock)())
            .await?;
        if affected == 0 {
            return Err(RegistryError::NotFound);
        }
        info!(
            stage = "registry",
            subscription_id = remote_subscription_id,
            %status,
            "subscription status updated"
        );
        Ok(())
    }

    /// Flags the subscription as revoked and returns the local users that owned it.
    pub async fn handle_revocation(
        &self,
        remote_subscription_id: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let subscriptions = self.database.subscriptions();
        let owners = subscriptions.owners_of(remote_subscription_id).await?;
        subscriptions
            .update_status(
                remote_subscription_id,
                &SubscriptionStatus::AuthorizationRevoked,
                (self.clock)(),
            )
            .await?;
        warn!(
            stage = "registry",
            subscription_id = remote_subscription_id,
            owners = owners.len(),
            "subscription authorization revoked"
        );
        Ok(owners)
    }

    /// Aligns every local record with the full remote listing.
    pub async fn reconcile(&self) -> Result<ReconcileReport, RegistryError> {
        match self.reconcile_inner().await {
            Ok(report) => {
                counter!("reconcile_runs_total", "result" => "ok").increment(1);
                counter!("reconcile_marked_missing_total")
                    .increment(report.marked_missing.len() as u64);
                info!(
                    stage = "reconcile",
                    remote_total = report.remote_total,
                    updated = report.updated,
                    marked_missing = report.marked_missing.len(),
                    "reconciliation finished"
                );
                Ok(report)
            }
            Err(err) => {
                counter!("reconcile_runs_total", "result" => "error").increment(1);
                warn!(stage = "reconcile", error = %err, "reconciliation failed");
                Err(err)
            }
        }
    }

    async fn reconcile_inner(&self) -> Result<ReconcileReport, RegistryError> {
        let remote = self.helix.list_subscriptions().await?;
        let subscriptions = self.database.subscriptions();
        let now = (self.clock)();

        let mut updated = 0;
        for subscription in &remote {
            let status = SubscriptionStatus::from_remote(&subscription.status);
            updated += subscriptions
                .sync_status(&subscription.id, &status, now)
                .await?;
        }

        let present: Vec<String> = remote.iter().map(|sub| sub.id.clone()).collect();
        let marked_missing = subscriptions.mark_missing(&present, now).await?;
        for id in &marked_missing {
            info!(stage = "reconcile", subscription_id = %id, "subscription not found on twitch");
        }

        Ok(ReconcileReport {
            remote_total: remote.len(),
            updated,
            marked_missing,
        })
    }

    /// Returns the user's linked Twitch identity, resolving the login and
    /// display name through Helix when they were never stored.
    pub async fn linked_identity(
        &self,
        user_id: &str,
    ) -> Result<Option<LinkedIdentity>, RegistryError> {
        let Some(account) = self
            .database
            .accounts()
            .find(user_id, TWITCH_PROVIDER)
            .await?
        else {
            return Ok(None);
        };

        if account.login.is_some() && account.display_name.is_some() {
            return Ok(Some(identity(account)));
        }

        match self.helix.get_user(&account.account_id).await {
            Ok(Some(user)) => {
                self.database
                    .accounts()
                    .update_profile(
                        user_id,
                        TWITCH_PROVIDER,
                        &user.login,
                        &user.display_name,
                        (self.clock)(),
                    )
                    .await?;
                Ok(Some(LinkedIdentity {
                    twitch_user_id: account.account_id,
                    twitch_username: Some(user.login),
                    display_name: Some(user.display_name),
                }))
            }
            Ok(None) => {
                warn!(stage = "registry", user_id, twitch_user_id = %account.account_id, "twitch user not found");
                Ok(Some(identity(account)))
            }
            Err(err) => {
                warn!(stage = "registry", user_id, error = %err, "failed to resolve twitch profile");
                Ok(Some(identity(account)))
            }
        }
    }
}

fn identity(account: LinkedAccount) -> LinkedIdentity {
    LinkedIdentity {
        twitch_user_id: account.account_id,
        twitch_username: account.login,
        display_name: account.display_name,
    }
}
