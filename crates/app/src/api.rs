use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{KeepAlive, Sse},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::live::{LiveStats, LiveStream};
use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    #[serde(default)]
    reward_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    limit: Option<String>,
}

pub async fn subscribe(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<SubscribeRequest>,
) -> Result<Json<Value>, ProblemResponse> {
    let reward_id = request
        .reward_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "missing_reward_id",
                "rewardId is required",
            )
        })?;

    let outcome = state.registry().subscribe(&user_id, &reward_id).await?;
    let message = if outcome.created {
        "Subscription created successfully"
    } else {
        "Subscription already exists"
    };
    Ok(Json(json!({
        "success": true,
        "subscriptionId": outcome.subscription.twitch_subscription_id,
        "status": outcome.subscription.status,
        "message": message,
    })))
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(reward_id): Path<String>,
) -> Result<Json<Value>, ProblemResponse> {
    state.registry().unsubscribe(&user_id, &reward_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Subscription deleted successfully",
    })))
}

pub async fn subscriptions(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Value>, ProblemResponse> {
    let subscriptions = state.registry().list_for_user(&user_id).await?;
    Ok(Json(json!({ "subscriptions": subscriptions })))
}

pub async fn twitch_info(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Value>, ProblemResponse> {
    let identity = state
        .registry()
        .linked_identity(&user_id)
        .await?
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "no_linked_account",
                "No Twitch account linked",
            )
        })?;
    Ok(Json(json!(identity)))
}

pub async fn events(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ProblemResponse> {
    let limit = query.limit.and_then(|raw| raw.parse::<u32>().ok());
    let events = state.redemptions().recent(&user_id, limit).await?;
    Ok(Json(json!({ "events": events })))
}

pub async fn sync(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
) -> Result<Json<Value>, ProblemResponse> {
    let report = state.registry().reconcile().await?;
    Ok(Json(json!({
        "success": true,
        "message": "Sync completed",
        "report": report,
    })))
}

pub async fn stream(State(state): State<AppState>, AuthUser(user_id): AuthUser) -> Sse<LiveStream> {
    let connection = state.live().subscribe(&user_id);
    Sse::new(connection.into_stream()).keep_alive(
        KeepAlive::new()
            .interval(state.sse_heartbeat())
            .text("heartbeat"),
    )
}

pub async fn stats(State(state): State<AppState>, AuthUser(_user_id): AuthUser) -> Json<LiveStats> {
    Json(state.live().stats())
}
