use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::info;

use redeem_relay_core::SharedClock;

use crate::oauth::{OAuthError, TwitchOAuthClient};

/// Tokens are refreshed this long before Twitch would reject them.
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Process-wide cache for the app access token.
///
/// The lock is held across the refresh call, so callers racing on an expired
/// token wait for a single request instead of issuing their own.
pub struct AppTokenCache {
    oauth: TwitchOAuthClient,
    clock: SharedClock,
    state: Mutex<Option<CachedToken>>,
}

impl AppTokenCache {
    pub fn new(oauth: TwitchOAuthClient, clock: SharedClock) -> Self {
        Self {
            oauth,
            clock,
            state: Mutex::new(None),
        }
    }

    /// Application client id, needed alongside the token on Helix calls.
    pub fn client_id(&self) -> &str {
        self.oauth.client_id()
    }

    /// Returns a token that stays valid for at least the refresh margin.
    pub async fn access_token(&self) -> Result<String, OAuthError> {
        let mut guard = self.state.lock().await;
        let now = (self.clock)();
        if let Some(cached) = guard.as_ref() {
            if now < cached.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self.oauth.client_credentials().await?;
        let expires_at = response.expires_at(now);
        metrics::counter!("remote_token_refresh_total").increment(1);
        info!(
            stage = "credentials",
            expires_at = %expires_at,
            "app access token refreshed"
        );

        let token = response.access_token;
        *guard = Some(CachedToken {
            access_token: token.clone(),
            expires_at,
        });
        Ok(token)
    }

    /// Drops the cached token if it is still the one that was rejected.
    pub async fn invalidate(&self, rejected: &str) {
        let mut guard = self.state.lock().await;
        if guard
            .as_ref()
            .is_some_and(|cached| cached.access_token == rejected)
        {
            *guard = None;
        }
    }
}
