//! `POST /message`: normalize the request into an `api.message_received`
//! signal and block for the matching outbound, up to the configured window.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use nerve_domain::message::InboundMessage;
use nerve_domain::signal::{types, Signal};

use super::{api_error, authorize, wait_for_reply};
use crate::senses::stable_signal_id;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    /// Logical channel target within the api channel (client name, chat id).
    pub channel: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Provider-side idempotency key for webhook-style retries. The key
    /// pins the signal id, so redeliveries collapse in the durable queue.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MessageRequest>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    if req.text.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "text must not be empty");
    }

    let correlation_id = req.correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let user_id = req
        .metadata
        .as_ref()
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("api")
        .to_string();

    let mut inbound = InboundMessage::new(
        req.text,
        "api",
        format!("api:{}", req.channel),
        user_id,
        correlation_id.clone(),
    );
    if let Some(metadata) = req.metadata {
        inbound.metadata = metadata;
    }

    let mut signal = Signal::new(
        types::API_MESSAGE_RECEIVED,
        "api",
        match serde_json::to_value(&inbound) {
            Ok(payload) => payload,
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
    )
    .with_correlation(correlation_id.clone())
    .durable();
    if let Some(key) = &req.idempotency_key {
        signal = signal.with_id(stable_signal_id("api", key));
    }

    // Subscribe before submitting so the reply cannot race past us.
    let rx = state.bus.subscribe_outbound();
    match state.ingress.submit(signal).await {
        Ok(true) => {}
        Ok(false) => {
            // The queue already holds this delivery; nothing new to wait on.
            return (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "duplicate",
                    "correlation_id": correlation_id,
                })),
            )
                .into_response();
        }
        Err(e) => return api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }

    let wait = std::time::Duration::from_secs(state.config.api.message_wait_seconds);
    match wait_for_reply(rx, &correlation_id, wait).await {
        Some(reply) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "correlation_id": correlation_id,
                "message": reply.message,
            })),
        )
            .into_response(),
        None => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "pending",
                "correlation_id": correlation_id,
            })),
        )
            .into_response(),
    }
}
