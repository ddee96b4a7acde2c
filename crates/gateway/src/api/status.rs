//! `POST /status` and `POST /timed-signals`: synchronous request signals.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use nerve_domain::signal::{types, Signal};

use super::{api_error, authorize, wait_for_reply};
use crate::state::AppState;

async fn request_reply(state: AppState, signal_type: &'static str) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    // A unique per-request target keeps concurrent callers apart.
    let channel_target = format!("api:req-{correlation_id}");
    let signal = Signal::new(
        signal_type,
        "api",
        serde_json::json!({
            "channel_type": "api",
            "channel_target": channel_target,
            "user_id": "api",
        }),
    )
    .with_correlation(correlation_id.clone());

    let rx = state.bus.subscribe_outbound();
    if let Err(e) = state.bus.publish(signal).await {
        return api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
    }

    let wait = std::time::Duration::from_secs(state.config.api.message_wait_seconds);
    match wait_for_reply(rx, &correlation_id, wait).await {
        Some(reply) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok", "message": reply.message})),
        )
            .into_response(),
        None => api_error(StatusCode::GATEWAY_TIMEOUT, "kernel did not answer in time"),
    }
}

pub async fn post_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    request_reply(state, types::API_STATUS_REQUESTED).await
}

pub async fn post_timed_signals(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    request_reply(state, types::API_TIMED_SIGNALS_REQUESTED).await
}
