use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::credentials::AppTokenCache;
use crate::oauth::OAuthError;

/// Client for the Helix EventSub and users endpoints.
#[derive(Clone)]
pub struct HelixClient {
    http: Client,
    base_url: Url,
    tokens: Arc<AppTokenCache>,
}

impl HelixClient {
    /// Creates a new Helix client with the provided configuration.
    pub fn new(base_url: Url, http: Client, tokens: Arc<AppTokenCache>) -> Self {
        Self {
            http,
            base_url,
            tokens,
        }
    }

    /// Creates a webhook subscription and returns the subscription Twitch reports back.
    pub async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest<'_>,
    ) -> Result<HelixSubscription, HelixError> {
        let url = self.base_url.join("eventsub/subscriptions")?;
        let body = CreateSubscriptionBody {
            kind: request.kind,
            version: request.version,
            condition: request.condition,
            transport: WebhookTransport {
                method: "webhook",
                callback: request.callback.as_str(),
                secret: request.secret,
            },
        };

        let response = self
            .send(|token| {
                self.authorized_request(Method::POST, url.clone(), token)
                    .json(&body)
            })
            .await?;

        let list: SubscriptionListResponse = parse_json(response).await?;
        list.data.into_iter().next().ok_or(HelixError::EmptyResponse)
    }

    /// Lists every subscription owned by the application, following pagination.
    pub async fn list_subscriptions(&self) -> Result<Vec<HelixSubscription>, HelixError> {
        let mut subscriptions = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut url = self.base_url.join("eventsub/subscriptions")?;
            if let Some(cursor) = after.as_deref() {
                url.query_pairs_mut().append_pair("after", cursor);
            }

            let response = self
                .send(|token| self.authorized_request(Method::GET, url.clone(), token))
                .await?;
            let page: SubscriptionListResponse = parse_json(response).await?;
            let fetched = page.data.len();
            subscriptions.extend(page.data);

            match page.pagination.and_then(|p| p.cursor) {
                Some(cursor) if !cursor.is_empty() && fetched > 0 => after = Some(cursor),
                _ => break,
            }
        }

        Ok(subscriptions)
    }

    /// Deletes a subscription by id.
    pub async fn delete_subscription(&self, subscription_id: &str) -> Result<(), HelixError> {
        let mut url = self.base_url.join("eventsub/subscriptions")?;
        url.query_pairs_mut().append_pair("id", subscription_id);

        let response = self
            .send(|token| self.authorized_request(Method::DELETE, url.clone(), token))
            .await?;

        ensure_success(response).await
    }

    /// Looks up a user by id; `None` when Twitch does not know the id.
    pub async fn get_user(&self, user_id: &str) -> Result<Option<HelixUser>, HelixError> {
        let mut url = self.base_url.join("users")?;
        url.query_pairs_mut().append_pair("id", user_id);

        let response = self
            .send(|token| self.authorized_request(Method::GET, url.clone(), token))
            .await?;

        let users: UserListResponse = parse_json(response).await?;
        Ok(users.data.into_iter().next())
    }

    /// Sends a request built for the current token. A 401 drops the token
    /// and the request is retried once with a fresh one.
    async fn send<F>(&self, build: F) -> Result<Response, HelixError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.tokens.access_token().await?;
        let response = build(token.as_str()).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(stage = "helix", "helix rejected app token; refreshing");
        self.tokens.invalidate(&token).await;
        let token = self.tokens.access_token().await?;
        let response = build(token.as_str()).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&token).await;
        }
        Ok(response)
    }

    fn authorized_request(&self, method: Method, url: Url, access_token: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("Client-Id", self.tokens.client_id())
            .header("Authorization", format!("Bearer {access_token}"))
    }
}

/// Parameters for creating a webhook subscription.
pub struct CreateSubscriptionRequest<'a> {
    pub kind: &'a str,
    pub version: &'a str,
    pub condition: &'a Value,
    pub callback: &'a Url,
    pub secret: &'a str,
}

#[derive(Serialize)]
struct CreateSubscriptionBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    version: &'a str,
    condition: &'a Value,
    transport: WebhookTransport<'a>,
}

#[derive(Serialize)]
struct WebhookTransport<'a> {
    method: &'a str,
    callback: &'a str,
    secret: &'a str,
}

/// Subscription as reported by Helix.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HelixSubscription {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub condition: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cost: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionListResponse {
    data: Vec<HelixSubscription>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
struct Pagination {
    cursor: Option<String>,
}

/// User profile fields returned by `GET /users`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HelixUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UserListResponse {
    data: Vec<HelixUser>,
}

/// Errors produced by the Helix client.
#[derive(Debug, Error)]
pub enum HelixError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to obtain app access token: {0}")]
    Credentials(#[from] OAuthError),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("helix returned no subscription in the response")]
    EmptyResponse,
}

async fn ensure_success(response: Response) -> Result<(), HelixError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(HelixError::Status { status, body });
    }
    Ok(())
}

async fn parse_json<T>(response: Response) -> Result<T, HelixError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(HelixError::Status { status, body });
    }

    Ok(response.json().await?)
}
