pub mod credentials;
pub mod helix;
pub mod oauth;

pub use credentials::AppTokenCache;
pub use helix::{CreateSubscriptionRequest, HelixClient, HelixError, HelixSubscription, HelixUser};
pub use oauth::{OAuthError, TokenResponse, TwitchOAuthClient};
