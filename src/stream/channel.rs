//! Persistent server-push channel to one topic URL
//!
//! Each named event is JSON-decoded and handed to the matching handler.
//! A bad payload drops that event only; a transport failure is reported
//! through `on_error` and handed to the reconnect policy.

use futures::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::reconnect::ReconnectPolicy;
use super::sse::{SseDecoder, SseFrame};
use crate::error::{Result, SyncError};

type EventFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type OpenFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type ErrorFn = Arc<dyn Fn(SyncError) -> BoxFuture<'static, ()> + Send + Sync>;

/// Event-name → handler table plus lifecycle callbacks.
#[derive(Clone, Default)]
pub struct EventHandlers {
    events: HashMap<String, EventFn>,
    on_open: Option<OpenFn>,
    on_error: Option<ErrorFn>,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched,
    /// No handler registered for the event name.
    Ignored,
    /// Decode or handler validation failed; the event was dropped.
    Dropped,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.events.insert(
            event.into(),
            Arc::new(move |payload| -> BoxFuture<'static, Result<()>> { Box::pin(handler(payload)) }),
        );
        self
    }

    pub fn on_open<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_open = Some(Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(callback()) }));
        self
    }

    pub fn on_error<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(SyncError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |err| -> BoxFuture<'static, ()> { Box::pin(callback(err)) }));
        self
    }

    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.events.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) async fn opened(&self) {
        if let Some(callback) = &self.on_open {
            callback().await;
        }
    }

    pub(crate) async fn failed(&self, err: SyncError) {
        match &self.on_error {
            Some(callback) => callback(err).await,
            None => warn!("Channel error with no error handler: {}", err),
        }
    }

    pub async fn dispatch(&self, topic: &str, frame: &SseFrame) -> DispatchOutcome {
        let Some(handler) = self.events.get(&frame.event) else {
            debug!("Ignoring unhandled event '{}' on {}", frame.event, topic);
            return DispatchOutcome::Ignored;
        };

        let payload: Value = match serde_json::from_str(&frame.data) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping undecodable '{}' event on {}: {}", frame.event, topic, e);
                return DispatchOutcome::Dropped;
            }
        };

        match handler(payload).await {
            Ok(()) => {
                debug!("Dispatched '{}' on {}", frame.event, topic);
                DispatchOutcome::Dispatched
            }
            Err(e) => {
                warn!("Dropping '{}' event on {}: {}", frame.event, topic, e);
                DispatchOutcome::Dropped
            }
        }
    }
}

/// Per-channel counters, shared between the channel task and its handle.
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub dispatched: AtomicU64,
    pub ignored: AtomicU64,
    pub dropped: AtomicU64,
    pub connects: AtomicU64,
    pub failures: AtomicU64,
}

impl ChannelStats {
    fn record(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Dispatched => &self.dispatched,
            DispatchOutcome::Ignored => &self.ignored,
            DispatchOutcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Feed a byte stream through the SSE decoder and dispatch every frame in
/// arrival order. Returns the transport error that ended the stream, if any.
pub async fn pump_events<S, B, E>(
    stream: S,
    decoder: &mut SseDecoder,
    handlers: &EventHandlers,
    topic: &str,
    stats: &ChannelStats,
) -> std::result::Result<(), E>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
{
    futures::pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for frame in decoder.feed(chunk.as_ref()) {
            let outcome = handlers.dispatch(topic, &frame).await;
            stats.record(outcome);
        }
    }
    Ok(())
}

pub struct StreamChannel;

impl StreamChannel {
    /// Open a channel to `url`. The connect happens on a spawned task; the
    /// returned handle is live immediately.
    pub fn open(
        client: Client,
        url: impl Into<String>,
        handlers: EventHandlers,
        policy: ReconnectPolicy,
    ) -> ChannelHandle {
        let url = url.into();
        let stats = Arc::new(ChannelStats::default());
        let task = tokio::spawn(supervise(client, url.clone(), handlers, policy, stats.clone()));

        ChannelHandle {
            url,
            abort: task.abort_handle(),
            closed: Arc::new(AtomicBool::new(false)),
            stats,
        }
    }
}

async fn supervise(
    client: Client,
    url: String,
    handlers: EventHandlers,
    policy: ReconnectPolicy,
    stats: Arc<ChannelStats>,
) {
    let mut decoder = SseDecoder::new();
    let mut attempt: u32 = 0;

    loop {
        let mut connected = false;
        let err = connect_once(&client, &url, &handlers, &mut decoder, &stats, &mut connected).await;
        stats.failures.fetch_add(1, Ordering::Relaxed);

        if connected {
            attempt = 0;
        }
        attempt += 1;
        handlers.failed(err).await;

        if !policy.should_retry(attempt) {
            info!("Giving up on {} after {} failed attempt(s)", url, attempt);
            return;
        }
        let delay = policy.delay(attempt, decoder.retry());
        info!("Reconnecting to {} in {:?} (attempt {})", url, delay, attempt);
        tokio::time::sleep(delay).await;
    }
}

async fn connect_once(
    client: &Client,
    url: &str,
    handlers: &EventHandlers,
    decoder: &mut SseDecoder,
    stats: &ChannelStats,
    connected: &mut bool,
) -> SyncError {
    let mut request = client
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache");
    if let Some(id) = decoder.last_event_id() {
        request = request.header("Last-Event-ID", id.to_string());
    }

    let response = match request.send().await {
        Ok(resp) => resp,
        Err(e) => return SyncError::connection(url, e),
    };
    if !response.status().is_success() {
        return SyncError::connection(url, format!("HTTP {}", response.status()));
    }

    *connected = true;
    stats.connects.fetch_add(1, Ordering::Relaxed);
    info!("Connected to {}", url);
    handlers.opened().await;

    // Partial frames never survive a reconnect; the last id and retry hint do.
    *decoder = decoder.resumed();

    match pump_events(response.bytes_stream(), decoder, handlers, url, stats).await {
        Ok(()) => SyncError::connection(url, "stream closed by server"),
        Err(e) => SyncError::connection(url, e),
    }
}

/// Owner's handle on an open channel. Closing is idempotent; dropping an
/// unclosed handle closes the channel immediately.
pub struct ChannelHandle {
    url: String,
    abort: AbortHandle,
    closed: Arc<AtomicBool>,
    stats: Arc<ChannelStats>,
}

impl ChannelHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close after `grace`, letting in-flight dispatch finish first.
    pub fn close_after(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let abort = self.abort.clone();
        let url = self.url.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) if !grace.is_zero() => {
                rt.spawn(async move {
                    tokio::time::sleep(grace).await;
                    abort.abort();
                    info!("Disconnected from {}", url);
                });
            }
            _ => {
                abort.abort();
                info!("Disconnected from {}", url);
            }
        }
    }

    pub fn close(&self) {
        self.close_after(Duration::ZERO);
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.abort.abort();
        }
    }
}
