//! `GET /events?channel_target=...`: stream outbound messages for one
//! target as server-sent events carrying newline-delimited JSON.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use serde::Deserialize;

use super::authorize;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub channel_target: String,
}

pub async fn get_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }

    let mut rx = state.bus.subscribe_outbound();
    let target = query.channel_target;

    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, std::convert::Infallible>> + Send>> =
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(msg) if msg.channel_target == target => {
                        let data = serde_json::to_string(&msg).unwrap_or_default();
                        yield Ok(Event::default().data(data));
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "sse subscriber lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
