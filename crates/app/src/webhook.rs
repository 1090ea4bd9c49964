use std::{sync::Arc, time::Instant};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use redeem_relay_core::{
    EventSubError, MessageKind, SubscriptionInfo, SubscriptionStatus, WebhookEnvelope,
};

use crate::bus::{EventBus, SubscriptionRevoked};
use crate::dedup::DuplicateFilter;
use crate::problem::ProblemResponse;
use crate::redemption::{QueuedRedemption, RedemptionQueue};
use crate::registry::{RegistryError, SubscriptionRegistry};
use crate::router::AppState;
use crate::verifier::{MessageHeaders, VerificationError, WebhookVerifier, HEADER_MESSAGE_TYPE};

/// What the sender gets back for an accepted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookReply {
    Challenge(String),
    Ack,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("verification payload must include challenge")]
    MissingChallenge,
    #[error("notification payload must include event")]
    MissingEvent,
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] EventSubError),
}

impl From<WebhookError> for ProblemResponse {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Verification(inner) => {
                ProblemResponse::new(inner.status(), inner.problem_type(), inner.to_string())
            }
            WebhookError::MissingChallenge => ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "missing_challenge",
                err.to_string(),
            ),
            WebhookError::MissingEvent => {
                ProblemResponse::new(StatusCode::BAD_REQUEST, "missing_event", err.to_string())
            }
            WebhookError::InvalidPayload(_) => {
                ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_payload", err.to_string())
            }
        }
    }
}

/// Protocol state machine for verified EventSub deliveries.
#[derive(Clone)]
pub struct WebhookDispatcher {
    verifier: Arc<WebhookVerifier>,
    dedup: DuplicateFilter,
    registry: SubscriptionRegistry,
    queue: RedemptionQueue,
    bus: EventBus,
}

impl WebhookDispatcher {
    pub fn new(
        verifier: WebhookVerifier,
        dedup: DuplicateFilter,
        registry: SubscriptionRegistry,
        queue: RedemptionQueue,
        bus: EventBus,
    ) -> Self {
        Self {
            verifier: Arc::new(verifier),
            dedup,
            registry,
            queue,
            bus,
        }
    }

    pub async fn dispatch(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookReply, WebhookError> {
        let start = Instant::now();
        let label = headers
            .get(HEADER_MESSAGE_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| MessageKind::from_header(value).metric_label())
            .unwrap_or("unknown");
        let result = self.dispatch_verified(headers, body).await;
        histogram!("webhook_ack_latency_seconds", "type" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_verified(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookReply, WebhookError> {
        let message = MessageHeaders::from_headers(headers)?;
        self.verifier.verify(&message, body)?;

        let kind = MessageKind::from_header(message.message_type);
        counter!("eventsub_ingress_total", "type" => kind.metric_label()).increment(1);
        let envelope = WebhookEnvelope::parse(body).inspect_err(|err| {
            warn!(stage = "ingress", message_id = message.message_id, error = %err, "unparseable webhook payload");
        })?;

        match kind {
            MessageKind::Verification => {
                let challenge = envelope
                    .challenge()
                    .map_err(|_| WebhookError::MissingChallenge)?
                    .to_string();
                self.confirm_subscription(&envelope.subscription).await;
                Ok(WebhookReply::Challenge(challenge))
            }
            MessageKind::Notification => {
                if envelope.event.is_none() {
                    return Err(WebhookError::MissingEvent);
                }
                if !self.already_handled(&message, &kind) {
                    self.forward_notification(&message, &envelope);
                }
                Ok(WebhookReply::Ack)
            }
            MessageKind::Revocation => {
                if !self.already_handled(&message, &kind) {
                    self.revoke(&envelope.subscription).await;
                }
                Ok(WebhookReply::Ack)
            }
            MessageKind::Unknown(ref value) => {
                if !self.already_handled(&message, &kind) {
                    warn!(
                        stage = "dispatch",
                        message_id = message.message_id,
                        message_type = %value,
                        subscription_type = %envelope.subscription.kind,
                        "unknown message type acknowledged"
                    );
                }
                Ok(WebhookReply::Ack)
            }
        }
    }

    /// Records the message id; `true` when it was seen inside the retention window.
    fn already_handled(&self, message: &MessageHeaders<'_>, kind: &MessageKind) -> bool {
        let duplicate = self.dedup.check_and_mark(message.message_id);
        if duplicate {
            counter!("eventsub_duplicate_total", "type" => kind.metric_label()).increment(1);
            info!(
                stage = "dispatch",
                message_id = message.message_id,
                message_type = kind.as_str(),
                "duplicate webhook message acknowledged"
            );
        }
        duplicate
    }

    async fn confirm_subscription(&self, subscription: &SubscriptionInfo) {
        match self
            .registry
            .update_status(&subscription.id, SubscriptionStatus::Enabled)
            .await
        {
            Ok(()) => {
                info!(stage = "dispatch", subscription_id = %subscription.id, "webhook callback verified");
            }
            Err(RegistryError::NotFound) => {
                info!(
                    stage = "dispatch",
                    subscription_id = %subscription.id,
                    "challenge answered for subscription unknown locally"
                );
            }
            Err(err) => {
                error!(stage = "dispatch", subscription_id = %subscription.id, error = %err, "failed to enable subscription");
            }
        }
    }

    fn forward_notification(&self, message: &MessageHeaders<'_>, envelope: &WebhookEnvelope) {
        let event = match envelope.redemption() {
            Ok(event) => event,
            Err(EventSubError::UnsupportedEventType(kind)) => {
                info!(stage = "dispatch", message_id = message.message_id, subscription_type = %kind, "ignoring unsupported event type");
                return;
            }
            Err(err) => {
                warn!(stage = "dispatch", message_id = message.message_id, error = %err, "failed to decode redemption event");
                return;
            }
        };

        let redemption_id = event.id.clone();
        let enabled_subscription = (SubscriptionStatus::from_remote(&envelope.subscription.status)
            == SubscriptionStatus::Enabled)
            .then(|| envelope.subscription.id.clone());
        let job = QueuedRedemption {
            event,
            enabled_subscription,
        };
        if let Err(err) = self.queue.enqueue(job) {
            error!(
                stage = "dispatch",
                message_id = message.message_id,
                redemption_id = %redemption_id,
                error = %err,
                "failed to hand off redemption"
            );
        }
    }

    async fn revoke(&self, subscription: &SubscriptionInfo) {
        match self.registry.handle_revocation(&subscription.id).await {
            Ok(owners) => {
                self.bus.publish_revoked(SubscriptionRevoked {
                    remote_subscription_id: subscription.id.clone(),
                    owners,
                    reason: subscription.status.clone(),
                });
            }
            Err(err) => {
                error!(stage = "dispatch", subscription_id = %subscription.id, error = %err, "failed to record revocation");
            }
        }
    }
}

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let reply = state.dispatcher().dispatch(&headers, &body).await?;
    Ok(match reply {
        WebhookReply::Challenge(challenge) => {
            ([(header::CONTENT_TYPE, "text/plain")], challenge).into_response()
        }
        WebhookReply::Ack => Json(json!({ "status": "ok" })).into_response(),
    })
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Twitch EventSub webhook endpoint",
        "timestamp": state.now().to_rfc3339(),
    }))
}
