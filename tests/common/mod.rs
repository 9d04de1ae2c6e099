//! Local SSE backend for integration tests
//!
//! Serves every `/api/sse/{*path}` topic from a broadcast channel the test
//! pushes into, counts connections per topic, and answers `/api/platforms`
//! with a canned registry list. Topics starting with `broken/` return 500.
//! A topic's snapshot events are sent first on every new connection.

#![allow(dead_code)]

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

#[derive(Default)]
struct ServerState {
    topics: Mutex<HashMap<String, broadcast::Sender<(String, String)>>>,
    connections: Mutex<HashMap<String, usize>>,
    snapshots: Mutex<HashMap<String, Vec<(String, String)>>>,
    platforms: Mutex<Vec<Value>>,
    platform_delay: Mutex<Duration>,
    platform_requests: AtomicUsize,
}

impl ServerState {
    fn sender(&self, path: &str) -> broadcast::Sender<(String, String)> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

pub struct TestBackend {
    pub base_url: String,
    state: Arc<ServerState>,
}

impl TestBackend {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/api/sse/{*path}", get(sse_topic))
            .route("/api/platforms", get(platforms))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { base_url: format!("http://{addr}"), state }
    }

    pub fn set_platforms(&self, platforms: Vec<Value>) {
        *self.state.platforms.lock().unwrap() = platforms;
    }

    /// Delay every `/api/platforms` answer by `delay`. The body still
    /// reflects the registry at request time.
    pub fn set_platform_delay(&self, delay: Duration) {
        *self.state.platform_delay.lock().unwrap() = delay;
    }

    pub fn platform_requests(&self) -> usize {
        self.state.platform_requests.load(Ordering::SeqCst)
    }

    /// Send `event` to every client of `path` as soon as it connects,
    /// replacing any earlier snapshot for the same event name.
    pub fn set_snapshot(&self, path: &str, event: &str, payload: Value) {
        let mut snapshots = self.state.snapshots.lock().unwrap();
        let frames = snapshots.entry(path.to_string()).or_default();
        frames.retain(|(name, _)| name != event);
        frames.push((event.to_string(), payload.to_string()));
    }

    /// Push one named event to every client of `path` (relative to `/api/sse/`).
    pub fn push(&self, path: &str, event: &str, payload: Value) {
        let _ = self.state.sender(path).send((event.to_string(), payload.to_string()));
    }

    /// Push a raw, possibly undecodable, data line.
    pub fn push_raw(&self, path: &str, event: &str, data: &str) {
        let _ = self.state.sender(path).send((event.to_string(), data.to_string()));
    }

    pub fn connections(&self, path: &str) -> usize {
        self.state.connections.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn live_clients(&self, path: &str) -> usize {
        self.state.sender(path).receiver_count()
    }

    /// Wait until `path` has at least `count` live clients.
    pub async fn wait_for_clients(&self, path: &str, count: usize) {
        wait_until(|| self.live_clients(path) >= count).await;
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

async fn sse_topic(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> Response {
    *state.connections.lock().unwrap().entry(path.clone()).or_default() += 1;
    if path.starts_with("broken/") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "unavailable").into_response();
    }

    let rx = state.sender(&path).subscribe();
    let snapshot = state.snapshots.lock().unwrap().get(&path).cloned().unwrap_or_default();
    let stream = tokio_stream::iter(snapshot)
        .chain(BroadcastStream::new(rx).filter_map(|item| item.ok()))
        .map(|(event, data)| Ok::<_, Infallible>(Event::default().event(event).data(data)));
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn platforms(State(state): State<Arc<ServerState>>) -> Json<Value> {
    state.platform_requests.fetch_add(1, Ordering::SeqCst);
    // Answer with the registry as it was when the request arrived.
    let platforms = state.platforms.lock().unwrap().clone();
    let delay = *state.platform_delay.lock().unwrap();
    tokio::time::sleep(delay).await;
    Json(json!({"EC": 0, "EM": "ok", "DT": platforms}))
}
