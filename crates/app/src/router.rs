use std::{sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use redeem_relay_core::SharedClock;
use redeem_relay_storage::Database;
use redeem_relay_twitch::HelixClient;
use redeem_relay_util::EventSubConfig;

use crate::auth::SessionTokenValidator;
use crate::bus::EventBus;
use crate::dedup::DuplicateFilter;
use crate::live::LiveHub;
use crate::redemption::{RedemptionQueue, RedemptionRouter, RedemptionWorker};
use crate::registry::SubscriptionRegistry;
use crate::verifier::WebhookVerifier;
use crate::webhook::WebhookDispatcher;
use crate::{api, telemetry, webhook};

const REDEMPTION_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    clock: SharedClock,
    dispatcher: WebhookDispatcher,
    registry: SubscriptionRegistry,
    redemptions: RedemptionRouter,
    live: LiveHub,
    bus: EventBus,
    dedup: DuplicateFilter,
    token_validator: SessionTokenValidator,
    sse_heartbeat: Duration,
}

impl AppState {
    /// Wires the ingestion pipeline. The returned worker must be spawned for
    /// accepted notifications to be routed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metrics: PrometheusHandle,
        database: Database,
        helix: HelixClient,
        eventsub: EventSubConfig,
        session_secret: Vec<u8>,
        dedup_retention: Duration,
        sse_heartbeat: Duration,
        clock: SharedClock,
    ) -> (Self, RedemptionWorker) {
        let secret: Option<Arc<[u8]>> = eventsub
            .secret
            .as_deref()
            .map(|secret| Arc::from(secret.as_bytes()));
        let verifier = WebhookVerifier::new(secret, clock.clone());
        let bus = EventBus::new();
        let dedup = DuplicateFilter::new(dedup_retention);
        let registry = SubscriptionRegistry::new(database.clone(), helix, eventsub, clock.clone());
        let redemptions = RedemptionRouter::new(database, bus.clone(), clock.clone());
        let (queue, worker) = RedemptionQueue::new(redemptions.clone(), REDEMPTION_QUEUE_CAPACITY);
        let dispatcher = WebhookDispatcher::new(
            verifier,
            dedup.clone(),
            registry.clone(),
            queue,
            bus.clone(),
        );

        let state = Self {
            metrics,
            clock,
            dispatcher,
            registry,
            redemptions,
            live: LiveHub::new(),
            bus,
            dedup,
            token_validator: SessionTokenValidator::new(&session_secret),
            sse_heartbeat,
        };
        (state, worker)
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn dispatcher(&self) -> &WebhookDispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn redemptions(&self) -> &RedemptionRouter {
        &self.redemptions
    }

    pub fn live(&self) -> &LiveHub {
        &self.live
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn dedup(&self) -> &DuplicateFilter {
        &self.dedup
    }

    pub fn token_validator(&self) -> &SessionTokenValidator {
        &self.token_validator
    }

    pub fn sse_heartbeat(&self) -> Duration {
        self.sse_heartbeat
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhook/twitch", post(webhook::handle).get(webhook::health))
        .route("/api/eventsub/subscribe", post(api::subscribe))
        .route("/api/eventsub/subscribe/:reward_id", delete(api::unsubscribe))
        .route("/api/eventsub/subscriptions", get(api::subscriptions))
        .route("/api/eventsub/twitch-info", get(api::twitch_info))
        .route("/api/eventsub/events", get(api::events))
        .route("/api/eventsub/sync", post(api::sync))
        .route("/api/events/stream", get(api::stream))
        .route("/api/events/stats", get(api::stats))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
