use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use redeem_relay_core::{RedemptionEvent, SubscriptionStatus};

/// Provider id stored in `accounts.provider_id` for Twitch identities.
pub const TWITCH_PROVIDER: &str = "twitch";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// In-memory databases are limited to a single connection so every query
    /// sees the same schema and shared-cache table locks cannot occur.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(SqliteSynchronous::Normal);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            // Dropping the only connection would drop the database with it.
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for local user rows.
    pub fn users(&self) -> UserRepository {
        UserRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for linked third-party accounts.
    pub fn accounts(&self) -> AccountRepository {
        AccountRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the EventSub subscription registry table.
    pub fn subscriptions(&self) -> SubscriptionRepository {
        SubscriptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for stored redemption events.
    pub fn redemptions(&self) -> RedemptionRepository {
        RedemptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
}

/// Repository for local users.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Inserts the user when absent; existing rows are left as-is.
    pub async fn ensure(
        &self,
        id: &str,
        name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), UserError> {
        sqlx::query(
            "INSERT INTO users (id, name, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(name)
        .bind(to_rfc3339(created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Errors that can occur while touching the users table.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for linked third-party identities.
#[derive(Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    /// Links (or relinks) a provider identity to a local user.
    pub async fn upsert(&self, account: &NewAccount<'_>) -> Result<(), AccountError> {
        let now = to_rfc3339(account.linked_at);
        sqlx::query(
            "INSERT INTO accounts \
             (id, user_id, provider_id, account_id, login, display_name, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, provider_id) DO UPDATE SET \
                 account_id = excluded.account_id, \
                 login = excluded.login, \
                 display_name = excluded.display_name, \
                 updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(account.user_id)
        .bind(account.provider_id)
        .bind(account.account_id)
        .bind(account.login)
        .bind(account.display_name)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns the user's linked account for the provider, if any.
    pub async fn find(
        &self,
        user_id: &str,
        provider_id: &str,
    ) -> Result<Option<LinkedAccount>, AccountError> {
        let account = sqlx::query_as::<_, LinkedAccount>(
            "SELECT user_id, provider_id, account_id, login, display_name \
             FROM accounts WHERE user_id = ? AND provider_id = ?",
        )
        .bind(user_id)
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// Stores profile fields resolved from the provider.
    pub async fn update_profile(
        &self,
        user_id: &str,
        provider_id: &str,
        login: &str,
        display_name: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), AccountError> {
        sqlx::query(
            "UPDATE accounts SET login = ?, display_name = ?, updated_at = ? \
             WHERE user_id = ? AND provider_id = ?",
        )
        .bind(login)
        .bind(display_name)
        .bind(to_rfc3339(updated_at))
        .bind(user_id)
        .bind(provider_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Parameters required to link an account.
pub struct NewAccount<'a> {
    pub user_id: &'a str,
    pub provider_id: &'a str,
    pub account_id: &'a str,
    pub login: Option<&'a str>,
    pub display_name: Option<&'a str>,
    pub linked_at: DateTime<Utc>,
}

/// Linked identity row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LinkedAccount {
    pub user_id: String,
    pub provider_id: String,
    pub account_id: String,
    pub login: Option<String>,
    pub display_name: Option<String>,
}

/// Errors that can occur while reading or writing accounts.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the EventSub subscription registry.
#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, twitch_subscription_id, broadcaster_id, reward_id, \
                                    status, created_at, updated_at";

impl SubscriptionRepository {
    /// Creates or replaces the subscription for `(user_id, reward_id)` in one statement.
    pub async fn upsert(
        &self,
        record: &NewSubscription<'_>,
    ) -> Result<SubscriptionRecord, SubscriptionError> {
        let now = to_rfc3339(record.updated_at);
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "INSERT INTO eventsub_subscriptions \
             (id, user_id, twitch_subscription_id, broadcaster_id, reward_id, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, reward_id) DO UPDATE SET \
                 twitch_subscription_id = excluded.twitch_subscription_id, \
                 broadcaster_id = excluded.broadcaster_id, \
                 status = excluded.status, \
                 updated_at = excluded.updated_at \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(record.user_id)
        .bind(record.twitch_subscription_id)
        .bind(record.broadcaster_id)
        .bind(record.reward_id)
        .bind(record.status.as_str())
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn find_for_user_reward(
        &self,
        user_id: &str,
        reward_id: &str,
    ) -> Result<Option<SubscriptionRecord>, SubscriptionError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM eventsub_subscriptions \
             WHERE user_id = ? AND reward_id = ?"
        ))
        .bind(user_id)
        .bind(reward_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Finds the enabled subscription that owns redemptions for `(broadcaster_id, reward_id)`.
    pub async fn find_enabled_owner(
        &self,
        broadcaster_id: &str,
        reward_id: &str,
    ) -> Result<Option<SubscriptionRecord>, SubscriptionError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM eventsub_subscriptions \
             WHERE broadcaster_id = ? AND reward_id = ? AND status = ? \
             ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(broadcaster_id)
        .bind(reward_id)
        .bind(SubscriptionStatus::Enabled.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Lists a user's subscriptions, newest first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<SubscriptionRecord>, SubscriptionError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM eventsub_subscriptions \
             WHERE user_id = ? ORDER BY created_at DESC, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Returns the local users whose subscriptions reference the remote id.
    pub async fn owners_of(
        &self,
        twitch_subscription_id: &str,
    ) -> Result<Vec<String>, SubscriptionError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM eventsub_subscriptions WHERE twitch_subscription_id = ?",
        )
        .bind(twitch_subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(user_id,)| user_id).collect())
    }

    /// Writes the status unconditionally and returns the number of affected rows.
    pub async fn update_status(
        &self,
        twitch_subscription_id: &str,
        status: &SubscriptionStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<u64, SubscriptionError> {
        let result = sqlx::query(
            "UPDATE eventsub_subscriptions SET status = ?, updated_at = ? \
             WHERE twitch_subscription_id = ?",
        )
        .bind(status.as_str())
        .bind(to_rfc3339(updated_at))
        .bind(twitch_subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Writes the status only when it differs from the stored value.
    pub async fn sync_status(
        &self,
        twitch_subscription_id: &str,
        status: &SubscriptionStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<u64, SubscriptionError> {
        let result = sqlx::query(
            "UPDATE eventsub_subscriptions SET status = ?, updated_at = ? \
             WHERE twitch_subscription_id = ? AND status != ?",
        )
        .bind(status.as_str())
        .bind(to_rfc3339(updated_at))
        .bind(twitch_subscription_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Flags every live record whose remote id is absent from `present_ids`.
    ///
    /// Revoked records and records already flagged are skipped. Returns the
    /// remote ids that were flagged.
    pub async fn mark_missing(
        &self,
        present_ids: &[String],
        updated_at: DateTime<Utc>,
    ) -> Result<Vec<String>, SubscriptionError> {
        let present = serde_json::to_string(present_ids)?;
        let rows: Vec<(String,)> = sqlx::query_as(
            "UPDATE eventsub_subscriptions SET status = ?, updated_at = ? \
             WHERE status NOT IN (?, ?) \
               AND twitch_subscription_id NOT IN (SELECT value FROM json_each(?)) \
             RETURNING twitch_subscription_id",
        )
        .bind(SubscriptionStatus::NotFoundOnRemote.as_str())
        .bind(to_rfc3339(updated_at))
        .bind(SubscriptionStatus::AuthorizationRevoked.as_str())
        .bind(SubscriptionStatus::NotFoundOnRemote.as_str())
        .bind(present)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Deletes the subscription for `(user_id, reward_id)`, returning whether a row existed.
    pub async fn delete(&self, user_id: &str, reward_id: &str) -> Result<bool, SubscriptionError> {
        let result =
            sqlx::query("DELETE FROM eventsub_subscriptions WHERE user_id = ? AND reward_id = ?")
                .bind(user_id)
                .bind(reward_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Parameters required to upsert a subscription.
pub struct NewSubscription<'a> {
    pub user_id: &'a str,
    pub twitch_subscription_id: &'a str,
    pub broadcaster_id: &'a str,
    pub reward_id: &'a str,
    pub status: &'a SubscriptionStatus,
    pub updated_at: DateTime<Utc>,
}

/// Subscription registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub id: String,
    pub user_id: String,
    pub twitch_subscription_id: String,
    pub broadcaster_id: String,
    pub reward_id: String,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    user_id: String,
    twitch_subscription_id: String,
    broadcaster_id: String,
    reward_id: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            status: SubscriptionStatus::from_stored(&row.status),
            id: row.id,
            user_id: row.user_id,
            twitch_subscription_id: row.twitch_subscription_id,
            broadcaster_id: row.broadcaster_id,
            reward_id: row.reward_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Errors that can occur while mutating subscriptions.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("failed to encode query parameter: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for stored redemption events.
#[derive(Clone)]
pub struct RedemptionRepository {
    pool: SqlitePool,
}

const REDEMPTION_COLUMNS: &str = "id, twitch_redemption_id, user_id, broadcaster_id, broadcaster_login, \
                                  broadcaster_name, viewer_id, viewer_login, viewer_name, reward_id, \
                                  reward_title, reward_cost, user_input, status, redeemed_at, processed_at";

impl RedemptionRepository {
    /// Stores the event keyed by its Twitch id.
    ///
    /// A redelivery only rewrites `status`, and only when it changed.
    pub async fn upsert(
        &self,
        record: &NewRedemption<'_>,
    ) -> Result<RedemptionUpsertOutcome, RedemptionError> {
        let id = Uuid::new_v4().to_string();
        let event = record.event;
        let row: Option<(String,)> = sqlx::query_as(
            "INSERT INTO redemption_events \
             (id, twitch_redemption_id, user_id, broadcaster_id, broadcaster_login, broadcaster_name, \
              viewer_id, viewer_login, viewer_name, reward_id, reward_title, reward_cost, user_input, \
              status, redeemed_at, processed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(twitch_redemption_id) DO UPDATE SET status = excluded.status \
             WHERE redemption_events.status != excluded.status \
             RETURNING id",
        )
        .bind(&id)
        .bind(&event.id)
        .bind(record.user_id)
        .bind(&event.broadcaster_user_id)
        .bind(&event.broadcaster_user_login)
        .bind(&event.broadcaster_user_name)
        .bind(&event.user_id)
        .bind(&event.user_login)
        .bind(&event.user_name)
        .bind(&event.reward.id)
        .bind(&event.reward.title)
        .bind(event.reward.cost)
        .bind(&event.user_input)
        .bind(event.status.as_str())
        .bind(to_rfc3339(event.redeemed_at))
        .bind(to_rfc3339(record.processed_at))
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((stored,)) if stored == id => RedemptionUpsertOutcome::Inserted { id },
            Some((stored,)) => RedemptionUpsertOutcome::StatusUpdated { id: stored },
            None => RedemptionUpsertOutcome::Unchanged,
        })
    }

    /// Lists a user's most recent events, newest first.
    pub async fn list_recent(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<RedemptionRecord>, RedemptionError> {
        let rows = sqlx::query_as::<_, RedemptionRecord>(&format!(
            "SELECT {REDEMPTION_COLUMNS} FROM redemption_events \
             WHERE user_id = ? ORDER BY processed_at DESC, redeemed_at DESC LIMIT ?"
        ))
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn find_by_twitch_id(
        &self,
        twitch_redemption_id: &str,
    ) -> Result<Option<RedemptionRecord>, RedemptionError> {
        let row = sqlx::query_as::<_, RedemptionRecord>(&format!(
            "SELECT {REDEMPTION_COLUMNS} FROM redemption_events WHERE twitch_redemption_id = ?"
        ))
        .bind(twitch_redemption_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// Event to persist together with its owning user.
pub struct NewRedemption<'a> {
    pub user_id: &'a str,
    pub event: &'a RedemptionEvent,
    pub processed_at: DateTime<Utc>,
}

/// Result of [`RedemptionRepository::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionUpsertOutcome {
    /// First sighting of the Twitch id; a new row was created.
    Inserted { id: String },
    /// Redelivery with a different status; only `status` was rewritten.
    StatusUpdated { id: String },
    /// Redelivery with the same status; nothing was written.
    Unchanged,
}

impl RedemptionUpsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }

    /// Label used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted { .. } => "inserted",
            Self::StatusUpdated { .. } => "status_updated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Stored redemption row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRecord {
    pub id: String,
    pub twitch_redemption_id: String,
    pub user_id: String,
    pub broadcaster_id: String,
    pub broadcaster_login: String,
    pub broadcaster_name: String,
    pub viewer_id: String,
    pub viewer_login: String,
    pub viewer_name: String,
    pub reward_id: String,
    pub reward_title: String,
    pub reward_cost: i64,
    pub user_input: String,
    pub status: String,
    pub redeemed_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

/// Errors that can occur while storing redemptions.
#[derive(Debug, Error)]
pub enum RedemptionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use redeem_relay_core::{RedemptionStatus, Reward};

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        for user in ["U1", "U2"] {
            db.users()
                .ensure(user, user, fixed_time(0))
                .await
                .expect("insert user");
        }
        db
    }

    fn fixed_time(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(offset_secs)
    }

    fn sample_event(id: &str, status: RedemptionStatus) -> RedemptionEvent {
        RedemptionEvent {
            id: id.to_string(),
            broadcaster_user_id: "B1".into(),
            broadcaster_user_login: "caster".into(),
            broadcaster_user_name: "Caster".into(),
            user_id: "V1".into(),
            user_login: "ann".into(),
            user_name: "Ann".into(),
            user_input: "hi".into(),
            status,
            reward: Reward {
                id: "R1".into(),
                title: "Pause".into(),
                cost: 500,
                prompt: String::new(),
            },
            redeemed_at: fixed_time(5),
        }
    }

    async fn insert_subscription(
        db: &Database,
        user_id: &str,
        reward_id: &str,
        remote_id: &str,
        status: SubscriptionStatus,
        at: i64,
    ) -> SubscriptionRecord {
        db.subscriptions()
            .upsert(&NewSubscription {
                user_id,
                twitch_subscription_id: remote_id,
                broadcaster_id: "B1",
                reward_id,
                status: &status,
                updated_at: fixed_time(at),
            })
            .await
            .expect("upsert subscription")
    }

    #[tokio::test]
    async fn migrations_apply() {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");

        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 4, "expected core tables to be created");
    }

    #[tokio::test]
    async fn subscription_upsert_keeps_one_row_per_user_and_reward() {
        let db = setup_db().await;
        let first = insert_subscription(&db, "U1", "R1", "sub-1", SubscriptionStatus::Pending, 0).await;
        let second =
            insert_subscription(&db, "U1", "R1", "sub-2", SubscriptionStatus::Enabled, 10).await;

        assert_eq!(first.id, second.id);
        assert_eq!(second.twitch_subscription_id, "sub-2");
        assert_eq!(second.status, SubscriptionStatus::Enabled);
        assert_eq!(second.created_at, fixed_time(0));
        assert_eq!(second.updated_at, fixed_time(10));

        let all = db.subscriptions().list_for_user("U1").await.expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn find_enabled_owner_ignores_other_statuses() {
        let db = setup_db().await;
        insert_subscription(&db, "U1", "R1", "sub-1", SubscriptionStatus::Pending, 0).await;

        let repo = db.subscriptions();
        assert!(repo.find_enabled_owner("B1", "R1").await.unwrap().is_none());

        repo.update_status("sub-1", &SubscriptionStatus::Enabled, fixed_time(1))
            .await
            .expect("update");
        let owner = repo
            .find_enabled_owner("B1", "R1")
            .await
            .unwrap()
            .expect("owner");
        assert_eq!(owner.user_id, "U1");
    }

    #[tokio::test]
    async fn update_status_reports_unknown_remote_id() {
        let db = setup_db().await;
        let affected = db
            .subscriptions()
            .update_status("missing", &SubscriptionStatus::Enabled, fixed_time(0))
            .await
            .expect("update");
        assert_eq!(affected, 0);
    }

    #[tokio::test]
    async fn sync_status_skips_identical_values() {
        let db = setup_db().await;
        insert_subscription(&db, "U1", "R1", "sub-1", SubscriptionStatus::Enabled, 0).await;
        let repo = db.subscriptions();

        let unchanged = repo
            .sync_status("sub-1", &SubscriptionStatus::Enabled, fixed_time(5))
            .await
            .unwrap();
        assert_eq!(unchanged, 0);

        let changed = repo
            .sync_status("sub-1", &SubscriptionStatus::AuthorizationRevoked, fixed_time(6))
            .await
            .unwrap();
        assert_eq!(changed, 1);
    }

    #[tokio::test]
    async fn mark_missing_flags_only_live_absent_records() {
        let db = setup_db().await;
        insert_subscription(&db, "U1", "R1", "sub-1", SubscriptionStatus::Enabled, 0).await;
        insert_subscription(&db, "U1", "R2", "sub-2", SubscriptionStatus::Enabled, 0).await;
        insert_subscription(&db, "U2", "R3", "sub-3", SubscriptionStatus::AuthorizationRevoked, 0)
            .await;
        let repo = db.subscriptions();

        let flagged = repo
            .mark_missing(&["sub-2".to_string()], fixed_time(10))
            .await
            .expect("mark missing");
        assert_eq!(flagged, vec!["sub-1".to_string()]);

        let records = repo.list_for_user("U1").await.unwrap();
        let sub1 = records.iter().find(|r| r.reward_id == "R1").unwrap();
        let sub2 = records.iter().find(|r| r.reward_id == "R2").unwrap();
        assert_eq!(sub1.status, SubscriptionStatus::NotFoundOnRemote);
        assert_eq!(sub2.status, SubscriptionStatus::Enabled);
        assert_eq!(sub2.updated_at, fixed_time(0));

        let again = repo.mark_missing(&[], fixed_time(20)).await.unwrap();
        assert_eq!(again, vec!["sub-2".to_string()]);
    }

    #[tokio::test]
    async fn owners_and_delete() {
        let db = setup_db().await;
        insert_subscription(&db, "U1", "R1", "sub-1", SubscriptionStatus::Enabled, 0).await;
        let repo = db.subscriptions();

        assert_eq!(repo.owners_of("sub-1").await.unwrap(), vec!["U1".to_string()]);
        assert!(repo.delete("U1", "R1").await.unwrap());
        assert!(!repo.delete("U1", "R1").await.unwrap());
        assert!(repo.owners_of("sub-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redemption_redelivery_updates_only_status() {
        let db = setup_db().await;
        let repo = db.redemptions();
        let first = sample_event("evt-1", RedemptionStatus::Unfulfilled);

        let outcome = repo
            .upsert(&NewRedemption {
                user_id: "U1",
                event: &first,
                processed_at: fixed_time(10),
            })
            .await
            .expect("insert");
        let RedemptionUpsertOutcome::Inserted { id } = outcome else {
            panic!("expected insert, got {outcome:?}");
        };

        let same = repo
            .upsert(&NewRedemption {
                user_id: "U1",
                event: &first,
                processed_at: fixed_time(20),
            })
            .await
            .expect("redelivery");
        assert_eq!(same, RedemptionUpsertOutcome::Unchanged);

        let mut changed = sample_event("evt-1", RedemptionStatus::Fulfilled);
        changed.user_input = "different".into();
        changed.reward.cost = 1;
        let outcome = repo
            .upsert(&NewRedemption {
                user_id: "U1",
                event: &changed,
                processed_at: fixed_time(30),
            })
            .await
            .expect("status update");
        assert_eq!(outcome, RedemptionUpsertOutcome::StatusUpdated { id: id.clone() });

        let stored = repo
            .find_by_twitch_id("evt-1")
            .await
            .unwrap()
            .expect("stored");
        assert_eq!(stored.id, id);
        assert_eq!(stored.status, "fulfilled");
        assert_eq!(stored.user_input, "hi");
        assert_eq!(stored.reward_cost, 500);
        assert_eq!(stored.processed_at, fixed_time(10));

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM redemption_events")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn list_recent_is_newest_first_and_bounded() {
        let db = setup_db().await;
        let repo = db.redemptions();
        for index in 0..5 {
            let event = sample_event(&format!("evt-{index}"), RedemptionStatus::Unfulfilled);
            repo.upsert(&NewRedemption {
                user_id: "U1",
                event: &event,
                processed_at: fixed_time(index),
            })
            .await
            .expect("insert");
        }

        let recent = repo.list_recent("U1", 3).await.expect("list");
        let ids: Vec<_> = recent.iter().map(|r| r.twitch_redemption_id.as_str()).collect();
        assert_eq!(ids, vec!["evt-4", "evt-3", "evt-2"]);
        assert!(repo.list_recent("U2", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn account_profile_updates_are_persisted() {
        let db = setup_db().await;
        let repo = db.accounts();
        repo.upsert(&NewAccount {
            user_id: "U1",
            provider_id: TWITCH_PROVIDER,
            account_id: "B1",
            login: None,
            display_name: None,
            linked_at: fixed_time(0),
        })
        .await
        .expect("link");

        repo.update_profile("U1", TWITCH_PROVIDER, "caster", "Caster", fixed_time(1))
            .await
            .expect("profile");

        let account = repo
            .find("U1", TWITCH_PROVIDER)
            .await
            .unwrap()
            .expect("account");
        assert_eq!(account.account_id, "B1");
        assert_eq!(account.display_name.as_deref(), Some("Caster"));
        assert!(repo.find("U2", TWITCH_PROVIDER).await.unwrap().is_none());
    }
}
