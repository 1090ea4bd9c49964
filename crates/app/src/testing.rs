//! Fixtures shared by the unit tests of this crate.

use std::{sync::Arc, time::Duration};

use axum::{body::Body, http::Request, response::Response};
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use httpmock::prelude::*;
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use url::Url;

use redeem_relay_core::{
    RedemptionEvent, RedemptionStatus, Reward, SharedClock, SubscriptionStatus,
};
use redeem_relay_storage::{
    Database, NewAccount, NewSubscription, SubscriptionRecord, TWITCH_PROVIDER,
};
use redeem_relay_twitch::{AppTokenCache, HelixClient, TwitchOAuthClient};
use redeem_relay_util::EventSubConfig;

use crate::auth::SessionClaims;
use crate::live;
use crate::router::{app_router, AppState};
use crate::telemetry;

pub(crate) const WEBHOOK_SECRET: &str = "0123456789abcdef";
pub(crate) const SESSION_SECRET: &[u8] = b"session-secret";

pub(crate) fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub(crate) fn fixed_clock() -> SharedClock {
    Arc::new(fixed_now)
}

pub(crate) async fn memory_database() -> Database {
    let database = Database::connect("sqlite::memory:")
        .await
        .expect("connect in-memory database");
    database.run_migrations().await.expect("run migrations");
    database
}

pub(crate) fn eventsub_config() -> EventSubConfig {
    EventSubConfig {
        secret: Some(WEBHOOK_SECRET.to_string()),
        callback_url: Some(
            Url::parse("https://relay.example.com/webhook/twitch").expect("callback url"),
        ),
    }
}

/// Helix client whose endpoints live on `server` under `/oauth2/` and `/helix/`.
pub(crate) fn helix_client(server: &MockServer) -> HelixClient {
    helix_client_at(
        &server.url("/oauth2/"),
        &server.url("/helix/"),
    )
}

/// Helix client pointing at a closed port, for tests that never reach Twitch.
pub(crate) fn offline_helix() -> HelixClient {
    helix_client_at("http://127.0.0.1:9/oauth2/", "http://127.0.0.1:9/helix/")
}

fn helix_client_at(oauth: &str, helix: &str) -> HelixClient {
    let http = Client::new();
    let oauth = TwitchOAuthClient::new(
        "client-id",
        "client-secret",
        Url::parse(oauth).expect("oauth url"),
        http.clone(),
    );
    let tokens = Arc::new(AppTokenCache::new(oauth, fixed_clock()));
    HelixClient::new(Url::parse(helix).expect("helix url"), http, tokens)
}

pub(crate) async fn mock_app_token(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/oauth2/token");
            then.status(200).json_body(json!({
                "access_token": "app-token",
                "expires_in": 3600,
                "token_type": "bearer"
            }));
        })
        .await
}

pub(crate) fn remote_subscription(id: &str, status: &str, broadcaster: &str, reward: &str) -> serde_json::Value {
    json!({
        "id": id,
        "status": status,
        "type": "channel.channel_points_custom_reward_redemption.add",
        "version": "1",
        "condition": { "broadcaster_user_id": broadcaster, "reward_id": reward },
        "created_at": "2024-01-01T12:00:00Z",
        "transport": { "method": "webhook", "callback": "https://relay.example.com/webhook/twitch" },
        "cost": 0
    })
}

pub(crate) async fn link_twitch_account(
    database: &Database,
    user_id: &str,
    twitch_user_id: &str,
    login: Option<&str>,
    display_name: Option<&str>,
) {
    database
        .users()
        .ensure(user_id, user_id, fixed_now())
        .await
        .expect("ensure user");
    database
        .accounts()
        .upsert(&NewAccount {
            user_id,
            provider_id: TWITCH_PROVIDER,
            account_id: twitch_user_id,
            login,
            display_name,
            linked_at: fixed_now(),
        })
        .await
        .expect("link account");
}

pub(crate) async fn store_subscription(
    database: &Database,
    user_id: &str,
    remote_id: &str,
    broadcaster_id: &str,
    reward_id: &str,
    status: SubscriptionStatus,
) -> SubscriptionRecord {
    database
        .users()
        .ensure(user_id, user_id, fixed_now())
        .await
        .expect("ensure user");
    database
        .subscriptions()
        .upsert(&NewSubscription {
            user_id,
            twitch_subscription_id: remote_id,
            broadcaster_id,
            reward_id,
            status: &status,
            updated_at: fixed_now(),
        })
        .await
        .expect("store subscription")
}

pub(crate) fn redemption_event(
    id: &str,
    broadcaster_id: &str,
    reward_id: &str,
    viewer_name: &str,
    cost: i64,
) -> RedemptionEvent {
    RedemptionEvent {
        id: id.to_string(),
        broadcaster_user_id: broadcaster_id.to_string(),
        broadcaster_user_login: "streamer".to_string(),
        broadcaster_user_name: "Streamer".to_string(),
        user_id: "viewer-1".to_string(),
        user_login: viewer_name.to_lowercase(),
        user_name: viewer_name.to_string(),
        user_input: String::new(),
        status: RedemptionStatus::Unfulfilled,
        reward: Reward {
            id: reward_id.to_string(),
            title: "Pause the stream".to_string(),
            cost,
            prompt: String::new(),
        },
        redeemed_at: fixed_now(),
    }
}

/// Fully wired application with its background workers running until drop.
pub(crate) struct TestApp {
    pub state: AppState,
    pub database: Database,
    shutdown: CancellationToken,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response {
        app_router(self.state.clone())
            .oneshot(request)
            .await
            .expect("router responds")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub(crate) async fn test_app() -> TestApp {
    test_app_with(offline_helix()).await
}

pub(crate) async fn test_app_with(helix: HelixClient) -> TestApp {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let database = memory_database().await;
    let (state, worker) = AppState::new(
        metrics,
        database.clone(),
        helix,
        eventsub_config(),
        SESSION_SECRET.to_vec(),
        Duration::from_secs(600),
        Duration::from_secs(30),
        fixed_clock(),
    );
    let shutdown = CancellationToken::new();
    worker.spawn(shutdown.clone());
    live::spawn_bridge(state.live().clone(), state.bus(), shutdown.clone());
    TestApp {
        state,
        database,
        shutdown,
    }
}

pub(crate) async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body should read")
        .to_bytes()
        .to_vec()
}

pub(crate) async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

pub(crate) async fn body_text(response: Response) -> String {
    String::from_utf8(body_bytes(response).await).expect("utf-8 body")
}

pub(crate) fn session_token(user_id: &str) -> String {
    session_token_expiring(user_id, fixed_now() + chrono::Duration::days(365))
}

pub(crate) fn session_token_expiring(user_id: &str, expires_at: DateTime<Utc>) -> String {
    let claims = SessionClaims {
        sub: user_id.to_string(),
        exp: expires_at.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SESSION_SECRET),
    )
    .expect("encode session token")
}
