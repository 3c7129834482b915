//! Server-Sent Events stream: `GET /agent/{agent_id}/events`.
//!
//! The handler subscribes to the agent's bus *before* fetching the replay
//! slice, so nothing published in between is missed — at the cost of
//! possible duplicates, which clients dedupe on `seq`. A pump task owns the
//! subscription and writes frames into the response body; when the client
//! goes away the body stream drops, the pump's next send fails, and it
//! unsubscribes on the way out. Heartbeat pings carry no `id:` line — they
//! are transport, not domain events.

use super::{AppState, bearer_token};
use crate::agent::is_valid_agent_id;
use crate::events::{Event, EventHub, Subscription, sanitize_event_name};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Frames buffered between the pump and the HTTP body.
const OUTBOUND_BUFFER: usize = 32;

/// GET /agent/{agent_id}/events — live event stream with replay.
pub async fn handle_events(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.auth.is_authorized(bearer_token(&headers)) {
        return (
            StatusCode::UNAUTHORIZED,
            "Unauthorized — provide Authorization: Bearer <token>",
        )
            .into_response();
    }

    if !is_valid_agent_id(&agent_id) {
        return (StatusCode::BAD_REQUEST, "invalid agent id").into_response();
    }

    let since = parse_last_event_id(&headers);

    // Subscribe first, then replay: the ring slice is fetched after the
    // queue exists, so concurrent publishes land in one or both — never in
    // neither.
    let subscription = state.hub.subscribe(&agent_id);
    let replay = match since {
        Some(seq) => state.hub.replay_since(&agent_id, seq),
        None => Vec::new(),
    };

    debug!(
        agent_id,
        replayed = replay.len(),
        since = ?since,
        "stream attached"
    );

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(OUTBOUND_BUFFER);
    tokio::spawn(stream_pump(
        Arc::clone(&state.hub),
        subscription,
        replay,
        state.heartbeat,
        tx,
    ));

    let body = Body::from_stream(ReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Owns the subscription for one connection; exits on client disconnect,
/// eviction, or hub shutdown, and always unsubscribes.
async fn stream_pump(
    hub: Arc<EventHub>,
    mut subscription: Subscription,
    replay: Vec<Event>,
    heartbeat: Duration,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let agent_id = subscription.agent_id().to_string();

    'stream: {
        for event in &replay {
            if tx.send(Ok(frame_bytes(event))).await.is_err() {
                break 'stream;
            }
        }

        loop {
            match tokio::time::timeout(heartbeat, subscription.recv()).await {
                Ok(Some(event)) => {
                    if tx.send(Ok(frame_bytes(&event))).await.is_err() {
                        // Client went away mid-write; not an error.
                        break;
                    }
                }
                Ok(None) => {
                    if subscription.was_evicted() {
                        warn!(agent_id, "stream evicted for falling behind");
                    }
                    break;
                }
                Err(_silence) => {
                    let ping = Event::ping(&agent_id);
                    if tx.send(Ok(frame_bytes(&ping))).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    hub.unsubscribe(&subscription);
    debug!(agent_id, "stream detached");
}

/// Parse `Last-Event-ID` as a non-negative integer; anything else counts as
/// absent rather than failing the request.
pub fn parse_last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Render one SSE frame: `id:` (sequenced events only), `event:`, `data:`.
pub fn sse_frame(event: &Event) -> String {
    let name = sanitize_event_name(event.kind.label());
    let data = serde_json::to_string(event)
        .unwrap_or_else(|_| json!({"type": "stream_error", "error": "serialization"}).to_string());

    match event.seq {
        Some(seq) => format!("id: {seq}\nevent: {name}\ndata: {data}\n\n"),
        None => format!("event: {name}\ndata: {data}\n\n"),
    }
}

fn frame_bytes(event: &Event) -> Bytes {
    Bytes::from(sse_frame(event))
}
