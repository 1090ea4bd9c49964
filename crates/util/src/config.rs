use std::{env, fmt, net::SocketAddr, time::Duration};

use url::Url;

use super::server_bind_address;

const DEFAULT_DATABASE_URL: &str = "sqlite://redeem-relay.db?mode=rwc";
const DEFAULT_OAUTH_BASE_URL: &str = "https://id.twitch.tv/oauth2/";
const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv/helix/";
const DEFAULT_DEDUP_RETENTION_SECS: u64 = 600;
const DEFAULT_SSE_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;
const EVENTSUB_SECRET_MIN_LEN: usize = 10;
const EVENTSUB_SECRET_MAX_LEN: usize = 100;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Credentials and endpoints for the Twitch application.
#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    pub oauth_base_url: Url,
    pub helix_base_url: Url,
}

/// Webhook transport settings. Either field may be absent, in which case
/// subscription management refuses to run and inbound webhooks fail closed.
#[derive(Debug, Clone, Default)]
pub struct EventSubConfig {
    pub secret: Option<String>,
    pub callback_url: Option<Url>,
}

impl EventSubConfig {
    /// Returns `true` when both the shared secret and the callback URL are present.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some() && self.callback_url.is_some()
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub twitch: TwitchConfig,
    pub eventsub: EventSubConfig,
    pub session_token_secret: Vec<u8>,
    pub dedup_retention: Duration,
    pub sse_heartbeat: Duration,
    pub reconcile_interval: Option<Duration>,
    pub sync_on_startup: bool,
    pub remote_timeout: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url = optional("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.into());

        let twitch = TwitchConfig {
            client_id: required("TWITCH_CLIENT_ID")?,
            client_secret: required("TWITCH_CLIENT_SECRET")?,
            oauth_base_url: url_or_default("TWITCH_OAUTH_BASE_URL", DEFAULT_OAUTH_BASE_URL)?,
            helix_base_url: url_or_default("TWITCH_HELIX_BASE_URL", DEFAULT_HELIX_BASE_URL)?,
        };

        let secret = optional("TWITCH_EVENTSUB_SECRET");
        if let Some(value) = &secret {
            if !(EVENTSUB_SECRET_MIN_LEN..=EVENTSUB_SECRET_MAX_LEN).contains(&value.len()) {
                return Err(ConfigError::InvalidValue {
                    name: "TWITCH_EVENTSUB_SECRET",
                    reason: format!(
                        "must be between {EVENTSUB_SECRET_MIN_LEN} and {EVENTSUB_SECRET_MAX_LEN} characters"
                    ),
                });
            }
        }
        let callback_url = optional("WEBHOOK_CALLBACK_URL")
            .map(|raw| parse_url("WEBHOOK_CALLBACK_URL", &raw))
            .transpose()?;

        let session_token_secret = required("SESSION_TOKEN_SECRET")?.into_bytes();
        let dedup_retention =
            positive_duration("DEDUP_RETENTION_SECS", DEFAULT_DEDUP_RETENTION_SECS)?;
        let sse_heartbeat = positive_duration("SSE_HEARTBEAT_SECS", DEFAULT_SSE_HEARTBEAT_SECS)?;
        let reconcile_interval = match seconds("RECONCILE_INTERVAL_SECS", 0)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let sync_on_startup = flag("SYNC_ON_STARTUP")?;
        let remote_timeout =
            positive_duration("REMOTE_TIMEOUT_SECS", DEFAULT_REMOTE_TIMEOUT_SECS)?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            twitch,
            eventsub: EventSubConfig {
                secret,
                callback_url,
            },
            session_token_secret,
            dedup_retention,
            sse_heartbeat,
            reconcile_interval,
            sync_on_startup,
            remote_timeout,
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn seconds(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            reason: format!("expected a whole number of seconds (got {raw})"),
        }),
    }
}

/// Like [`seconds`] but zero is rejected; these settings drive timers.
fn positive_duration(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match seconds(name, default)? {
        0 => Err(ConfigError::InvalidValue {
            name,
            reason: "must be greater than zero".to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn flag(name: &'static str) -> Result<bool, ConfigError> {
    match optional(name).as_deref().map(str::trim) {
        None => Ok(false),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            name,
            reason: format!("expected true or false (got {other})"),
        }),
    }
}

fn url_or_default(name: &'static str, default: &str) -> Result<Url, ConfigError> {
    let raw = optional(name).unwrap_or_else(|| default.to_string());
    parse_url(name, &raw)
}

fn parse_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|err| ConfigError::InvalidValue {
        name,
        reason: err.to_string(),
    })
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidValue { name: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(name) => write!(f, "{name} must be set"),
            Self::InvalidValue { name, reason } => write!(f, "invalid {name} value: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::ENV_GUARD;
    use crate::DEFAULT_BIND_ADDR;

    const MANAGED_VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "TWITCH_CLIENT_ID",
        "TWITCH_CLIENT_SECRET",
        "TWITCH_OAUTH_BASE_URL",
        "TWITCH_HELIX_BASE_URL",
        "TWITCH_EVENTSUB_SECRET",
        "WEBHOOK_CALLBACK_URL",
        "SESSION_TOKEN_SECRET",
        "DEDUP_RETENTION_SECS",
        "SSE_HEARTBEAT_SECS",
        "RECONCILE_INTERVAL_SECS",
        "SYNC_ON_STARTUP",
        "REMOTE_TIMEOUT_SECS",
    ];

    fn reset_env() {
        for name in MANAGED_VARS {
            env::remove_var(name);
        }
    }

    fn set_required() {
        env::set_var("TWITCH_CLIENT_ID", "client");
        env::set_var("TWITCH_CLIENT_SECRET", "secret");
        env::set_var("SESSION_TOKEN_SECRET", "session-secret");
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|err| err.into_inner());
        reset_env();
        set_required();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.dedup_retention, Duration::from_secs(600));
        assert_eq!(config.sse_heartbeat, Duration::from_secs(30));
        assert!(config.reconcile_interval.is_none());
        assert!(!config.sync_on_startup);
        assert!(!config.eventsub.is_configured());
        assert_eq!(config.twitch.helix_base_url.as_str(), DEFAULT_HELIX_BASE_URL);

        reset_env();
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|err| err.into_inner());
        reset_env();
        set_required();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        reset_env();
    }

    #[test]
    fn reports_missing_client_credentials() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|err| err.into_inner());
        reset_env();
        env::set_var("SESSION_TOKEN_SECRET", "session-secret");

        let err = AppConfig::from_env().expect_err("missing client id");
        assert!(matches!(err, ConfigError::Missing("TWITCH_CLIENT_ID")));

        reset_env();
    }

    #[test]
    fn parses_eventsub_and_schedule_settings() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|err| err.into_inner());
        reset_env();
        set_required();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("TWITCH_EVENTSUB_SECRET", "a-long-enough-secret");
        env::set_var("WEBHOOK_CALLBACK_URL", "https://relay.example.com/webhook/twitch");
        env::set_var("RECONCILE_INTERVAL_SECS", "3600");
        env::set_var("SYNC_ON_STARTUP", "true");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert!(config.eventsub.is_configured());
        assert_eq!(config.reconcile_interval, Some(Duration::from_secs(3600)));
        assert!(config.sync_on_startup);

        reset_env();
    }

    #[test]
    fn rejects_short_eventsub_secret() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|err| err.into_inner());
        reset_env();
        set_required();
        env::set_var("TWITCH_EVENTSUB_SECRET", "short");

        let err = AppConfig::from_env().expect_err("short secret");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "TWITCH_EVENTSUB_SECRET",
                ..
            }
        ));

        reset_env();
    }

    #[test]
    fn rejects_non_numeric_durations() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|err| err.into_inner());
        reset_env();
        set_required();
        env::set_var("DEDUP_RETENTION_SECS", "ten");

        let err = AppConfig::from_env().expect_err("non numeric");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "DEDUP_RETENTION_SECS",
                ..
            }
        ));

        reset_env();
    }

    #[test]
    fn rejects_zero_for_timer_durations() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|err| err.into_inner());

        for name in ["DEDUP_RETENTION_SECS", "SSE_HEARTBEAT_SECS", "REMOTE_TIMEOUT_SECS"] {
            reset_env();
            set_required();
            env::set_var(name, "0");

            let err = AppConfig::from_env().expect_err("zero duration");
            match err {
                ConfigError::InvalidValue { name: rejected, reason } => {
                    assert_eq!(rejected, name);
                    assert_eq!(reason, "must be greater than zero");
                }
                other => panic!("unexpected error for {name}: {other}"),
            }
        }

        reset_env();
        set_required();
        env::set_var("RECONCILE_INTERVAL_SECS", "0");
        let config = AppConfig::from_env().expect("zero disables reconciliation");
        assert_eq!(config.reconcile_interval, None);

        reset_env();
    }
}
