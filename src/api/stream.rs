//! Live event streaming: Server-Sent Events with Last-Event-ID replay, and a
//! WebSocket mirror with the same filter semantics.

use super::{check_token, AppState, QueryMap};
use crate::events::store::REPLAY_CAP;
use crate::events::Event;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{self, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Subscriber-side filter: event types and/or a specific run.
#[derive(Debug, Clone, Default)]
struct StreamFilter {
    types: Option<HashSet<String>>,
    run_id: Option<String>,
}

impl StreamFilter {
    fn from_query(query: &HashMap<String, String>) -> Self {
        let types = query.get("types").and_then(|raw| {
            let set: HashSet<String> = raw
                .replace(',', " ")
                .split_whitespace()
                .map(str::to_string)
                .collect();
            (!set.is_empty()).then_some(set)
        });
        Self {
            types,
            run_id: query.get("run_id").cloned(),
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(run_id) = &self.run_id {
            if event.run_id() != Some(run_id.as_str()) {
                return false;
            }
        }
        true
    }
}

pub async fn sse_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Result<Sse<impl Stream<Item = Result<sse::Event, Infallible>>>, StatusCode> {
    check_token(&state.settings, &headers, &query)?;
    let filter = StreamFilter::from_query(&query);
    let client_id = headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Replay position: explicit Last-Event-ID first, stored cursor second.
    let last_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .or_else(|| client_id.as_deref().and_then(|id| state.store.cursor(id)));

    let (listener_id, mut live) = state.store.register_listener();
    let replay = match last_id {
        Some(ts) => state.store.after(ts, REPLAY_CAP, None).await,
        None => Vec::new(),
    };

    let (tx, rx) = mpsc::channel::<Event>(256);
    let store = state.store.clone();
    let forward_filter = filter.clone();
    tokio::spawn(async move {
        for event in replay {
            if !forward_filter.matches(&event) {
                continue;
            }
            if tx.send(event).await.is_err() {
                store.unregister_listener(listener_id);
                return;
            }
        }
        while let Some(event) = live.recv().await {
            if !forward_filter.matches(&event) {
                continue;
            }
            if let Some(client_id) = &client_id {
                store.set_cursor(client_id, event.ts);
            }
            if tx.send(event).await.is_err() {
                break;
            }
        }
        store.unregister_listener(listener_id);
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(sse::Event::default().id(event.ts.to_string()).data(data))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    ))
}

pub async fn ws_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
    ws: WebSocketUpgrade,
) -> Response {
    if check_token(&state.settings, &headers, &query).is_err() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let filter = StreamFilter::from_query(&query);
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, filter: StreamFilter) {
    let (listener_id, mut live) = state.store.register_listener();
    loop {
        tokio::select! {
            event = live.recv() => {
                let Some(event) = event else { break };
                if !filter.matches(&event) {
                    continue;
                }
                let text = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // pings are answered by axum; other frames are ignored
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    state.store.unregister_listener(listener_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, run_id: Option<&str>) -> Event {
        let data = match run_id {
            Some(run_id) => serde_json::json!({ "run_id": run_id }),
            None => serde_json::json!({}),
        };
        Event::new(event_type, data, "test")
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = StreamFilter::default();
        assert!(filter.matches(&event("anything", None)));
    }

    #[test]
    fn type_filter_accepts_commas_and_spaces() {
        let mut query = HashMap::new();
        query.insert("types".to_string(), "fetch_progress,run_done".to_string());
        let filter = StreamFilter::from_query(&query);
        assert!(filter.matches(&event("fetch_progress", None)));
        assert!(filter.matches(&event("run_done", None)));
        assert!(!filter.matches(&event("batch_complete", None)));
    }

    #[test]
    fn run_filter_requires_matching_run() {
        let mut query = HashMap::new();
        query.insert("run_id".to_string(), "r-7".to_string());
        let filter = StreamFilter::from_query(&query);
        assert!(filter.matches(&event("fetch_progress", Some("r-7"))));
        assert!(!filter.matches(&event("fetch_progress", Some("r-8"))));
        assert!(!filter.matches(&event("fetch_progress", None)));
    }
}
