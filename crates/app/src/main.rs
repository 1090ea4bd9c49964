mod api;
mod auth;
mod bus;
mod dedup;
mod live;
mod problem;
mod reconcile;
mod redemption;
mod registry;
mod router;
mod telemetry;
#[cfg(test)]
mod testing;
mod verifier;
mod webhook;

use std::{net::SocketAddr, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use redeem_relay_core::system_clock;
use redeem_relay_storage::Database;
use redeem_relay_twitch::{AppTokenCache, HelixClient, TwitchOAuthClient};
use redeem_relay_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let clock = system_clock();
    let http = reqwest::Client::builder()
        .timeout(config.remote_timeout)
        .build()?;
    let oauth = TwitchOAuthClient::new(
        config.twitch.client_id.clone(),
        config.twitch.client_secret.clone(),
        config.twitch.oauth_base_url.clone(),
        http.clone(),
    );
    let tokens = Arc::new(AppTokenCache::new(oauth, clock.clone()));
    let helix = HelixClient::new(config.twitch.helix_base_url.clone(), http, tokens);

    if !config.eventsub.is_configured() {
        warn!(stage = "app", "eventsub secret or callback url missing; webhooks will be rejected");
    }

    let (state, worker) = router::AppState::new(
        metrics,
        database,
        helix,
        config.eventsub.clone(),
        config.session_token_secret.clone(),
        config.dedup_retention,
        config.sse_heartbeat,
        clock,
    );

    let shutdown = CancellationToken::new();
    worker.spawn(shutdown.clone());
    state
        .dedup()
        .clone()
        .spawn_sweeper(config.dedup_retention, shutdown.clone());
    live::spawn_bridge(state.live().clone(), state.bus(), shutdown.clone());
    if config.sync_on_startup {
        reconcile::run_startup_sync(state.registry().clone());
    }
    if let Some(period) = config.reconcile_interval {
        reconcile::ReconcileJob::new(state.registry().clone(), period).spawn(shutdown.clone());
    }

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(stage = "app", error = %err, "failed to listen for shutdown signal");
            }
            info!(stage = "app", "shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
