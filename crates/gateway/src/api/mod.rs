//! The HTTP gateway: a thin translation layer between requests and bus
//! signals. It holds no kernel state of its own.

mod events;
mod message;
mod status;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;

use nerve_domain::message::OutboundMessage;

use crate::state::AppState;

pub const TOKEN_HEADER: &str = "x-agent-api-token";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/message", post(message::post_message))
        .route("/events", get(events::get_events))
        .route("/status", post(status::post_status))
        .route("/timed-signals", post(status::post_timed_signals))
        .route("/healthz", get(healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.store.current_state() {
        Ok(current) => Json(serde_json::json!({"ok": true, "state": current})).into_response(),
        Err(_) => api_error(StatusCode::SERVICE_UNAVAILABLE, "storage unavailable"),
    }
}

/// Standardized JSON error body.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

/// Constant-time token check against the startup-computed hash. No
/// configured token means dev mode.
pub(crate) fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.api_token_hash else {
        return Ok(());
    };
    let presented = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let presented_hash = Sha256::digest(presented.as_bytes());
    if presented_hash.as_slice().ct_eq(expected.as_slice()).into() {
        Ok(())
    } else {
        Err(api_error(StatusCode::UNAUTHORIZED, "invalid or missing token"))
    }
}

/// Wait on the outbound broadcast for the first message carrying
/// `correlation_id`, up to the deadline.
pub(crate) async fn wait_for_reply(
    mut rx: broadcast::Receiver<OutboundMessage>,
    correlation_id: &str,
    wait: std::time::Duration,
) -> Option<OutboundMessage> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(msg)) if msg.correlation_id == correlation_id => return Some(msg),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => return None,
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerve_domain::config::{Config, PublishMode};
    use nerve_domain::message::InboundMessage;
    use nerve_store::Store;
    use std::sync::Arc;

    fn state(token: Option<&str>) -> AppState {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (bus, _rx) = crate::bus::Bus::new(8, PublishMode::Block);
        AppState {
            config: Arc::new(Config::default()),
            store: store.clone(),
            obs: store.clone(),
            bus: bus.clone(),
            ingress: crate::bus::SignalIngress::new(bus, store),
            api_token_hash: token.map(AppState::token_hash),
        }
    }

    #[test]
    fn dev_mode_allows_everything() {
        let state = state(None);
        assert!(authorize(&state, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn wrong_token_rejected() {
        let state = state(Some("secret"));
        assert!(authorize(&state, &HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "wrong".parse().unwrap());
        assert!(authorize(&state, &headers).is_err());

        headers.insert(TOKEN_HEADER, "secret".parse().unwrap());
        assert!(authorize(&state, &headers).is_ok());
    }

    #[tokio::test]
    async fn wait_for_reply_matches_correlation() {
        let state = state(None);
        let rx = state.bus.subscribe_outbound();
        let bus = state.bus.clone();

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let other = InboundMessage::new("x", "api", "api:a", "u", "OTHER");
            bus.publish_outbound(OutboundMessage::reply_to(&other, "not this one"));
            let wanted = InboundMessage::new("x", "api", "api:a", "u", "WANTED");
            bus.publish_outbound(OutboundMessage::reply_to(&wanted, "this one"));
        });

        let reply = wait_for_reply(rx, "WANTED", std::time::Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply.message, "this one");
    }

    #[tokio::test]
    async fn wait_for_reply_times_out() {
        let state = state(None);
        let rx = state.bus.subscribe_outbound();
        let reply = wait_for_reply(rx, "NEVER", std::time::Duration::from_millis(30)).await;
        assert!(reply.is_none());
    }
}
