//! Shared-subscription broker
//!
//! Several consumers of the same topic share one underlying channel. The
//! channel opens with the first subscriber and closes when the last
//! subscription is dropped; events fan out over a broadcast channel.
//!
//! Each topic remembers its connection state and the last payload per event
//! name, so a subscriber joining after the backend sent its snapshot can have
//! it replayed instead of waiting for a reconnect that never comes.

use reqwest::Client;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use std::pin::Pin;
use std::task::{Context, Poll};
use futures_util::Stream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use super::channel::{ChannelHandle, EventHandlers, StreamChannel};
use super::reconnect::ReconnectPolicy;

const DEFAULT_CAPACITY: usize = 1024;

/// What a shared channel fans out to its local listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Message { event: String, payload: Value },
    /// Connection-level failure, rendered as text so it can be cloned to every listener.
    Error(String),
    /// This listener fell behind and lost that many events. Never sent by the
    /// channel itself; synthesized on the receiving side.
    Lagged(u64),
}

#[derive(Default)]
struct FeedState {
    connected: bool,
    seq: u64,
    latest: HashMap<String, (u64, Value)>,
}

/// Fan-out sender plus the last-known state of one topic. Publishing and
/// joining take the same lock, so a joiner gets each event once: replayed
/// or live, never both.
struct TopicFeed {
    tx: broadcast::Sender<ChannelEvent>,
    state: Mutex<FeedState>,
}

impl TopicFeed {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, state: Mutex::new(FeedState::default()) }
    }

    fn publish(&self, event: ChannelEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &event {
            ChannelEvent::Opened => state.connected = true,
            ChannelEvent::Error(_) => state.connected = false,
            ChannelEvent::Message { event, payload } => {
                state.seq += 1;
                let seq = state.seq;
                state.latest.insert(event.clone(), (seq, payload.clone()));
            }
            ChannelEvent::Lagged(_) => {}
        }
        let _ = self.tx.send(event);
    }

    /// A fresh receiver and, when `replay` is set, the backlog a late joiner
    /// missed: `Opened` if connected, then the cached payloads for `names`
    /// in arrival order.
    fn join(&self, names: &BTreeSet<String>, replay: bool) -> (broadcast::Receiver<ChannelEvent>, VecDeque<ChannelEvent>) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let rx = self.tx.subscribe();
        let mut backlog = VecDeque::new();
        if !replay {
            return (rx, backlog);
        }

        let mut cached: Vec<(u64, ChannelEvent)> = state
            .latest
            .iter()
            .filter(|(name, _)| names.contains(*name))
            .map(|(name, (seq, payload))| (*seq, ChannelEvent::Message { event: name.clone(), payload: payload.clone() }))
            .collect();
        cached.sort_by_key(|(seq, _)| *seq);

        if state.connected {
            backlog.push_back(ChannelEvent::Opened);
        }
        backlog.extend(cached.into_iter().map(|(_, event)| event));
        (rx, backlog)
    }
}

struct SharedTopic {
    handle: ChannelHandle,
    feed: Arc<TopicFeed>,
    events: BTreeSet<String>,
    refs: usize,
}

struct BrokerInner {
    client: Client,
    policy: ReconnectPolicy,
    close_grace: Duration,
    capacity: usize,
    topics: Mutex<HashMap<String, SharedTopic>>,
}

/// Reference-counted pool of channels keyed by topic URL.
#[derive(Clone)]
pub struct SubscriptionBroker {
    inner: Arc<BrokerInner>,
}

impl SubscriptionBroker {
    /// `close_grace` delays closing a topic after its last subscriber leaves.
    pub fn new(client: Client, policy: ReconnectPolicy, close_grace: Duration) -> Self {
        Self::with_capacity(client, policy, close_grace, DEFAULT_CAPACITY)
    }

    /// Like `new`, with `capacity` events buffered per listener before it lags.
    pub fn with_capacity(client: Client, policy: ReconnectPolicy, close_grace: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                client,
                policy,
                close_grace,
                capacity: capacity.max(1),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Join the shared channel for `topic_url`, opening it if this is the
    /// first subscriber. Event names not yet forwarded by an existing channel
    /// cause it to be reopened with the union of names.
    pub fn subscribe<I, S>(&self, topic_url: &str, event_names: I) -> BrokerSubscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join(topic_url, event_names.into_iter().map(Into::into).collect(), false)
    }

    /// Like `subscribe`, but first hands back what the topic already
    /// delivered: `Opened` if connected and the latest payload of each
    /// requested event. For topics whose snapshot is only sent once per
    /// connection.
    pub fn subscribe_with_replay<I, S>(&self, topic_url: &str, event_names: I) -> BrokerSubscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join(topic_url, event_names.into_iter().map(Into::into).collect(), true)
    }

    fn join(&self, topic_url: &str, wanted: BTreeSet<String>, replay: bool) -> BrokerSubscription {
        let mut topics = self.inner.topics.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(shared) = topics.get_mut(topic_url) {
            if !wanted.is_subset(&shared.events) {
                let union: BTreeSet<String> = shared.events.union(&wanted).cloned().collect();
                info!("Reopening shared channel {} for {} event name(s)", topic_url, union.len());
                let handle = self.open_forwarding(topic_url, &union, shared.feed.clone());
                let old = std::mem::replace(&mut shared.handle, handle);
                old.close();
                shared.events = union;
            }
            shared.refs += 1;
            debug!("Shared channel {} now has {} subscriber(s)", topic_url, shared.refs);
            let (rx, backlog) = shared.feed.join(&wanted, replay);
            if !backlog.is_empty() {
                debug!("Replaying {} cached event(s) from {}", backlog.len(), topic_url);
            }
            return BrokerSubscription::new(rx, backlog, self.topic_ref(topic_url));
        }

        let feed = Arc::new(TopicFeed::new(self.inner.capacity));
        let (rx, backlog) = feed.join(&wanted, replay);
        let handle = self.open_forwarding(topic_url, &wanted, feed.clone());
        info!("Opened shared channel {}", topic_url);
        topics.insert(
            topic_url.to_string(),
            SharedTopic { handle, feed, events: wanted, refs: 1 },
        );

        BrokerSubscription::new(rx, backlog, self.topic_ref(topic_url))
    }

    fn topic_ref(&self, topic_url: &str) -> TopicRef {
        TopicRef { topic: topic_url.to_string(), broker: self.inner.clone() }
    }

    fn open_forwarding(&self, topic_url: &str, events: &BTreeSet<String>, feed: Arc<TopicFeed>) -> ChannelHandle {
        let mut handlers = EventHandlers::new();
        for name in events {
            let feed = feed.clone();
            let event = name.clone();
            handlers = handlers.on(name.clone(), move |payload| {
                feed.publish(ChannelEvent::Message { event: event.clone(), payload });
                async { Ok(()) }
            });
        }
        let open_feed = feed.clone();
        let error_feed = feed;
        handlers = handlers
            .on_open(move || {
                open_feed.publish(ChannelEvent::Opened);
                async {}
            })
            .on_error(move |err| {
                error_feed.publish(ChannelEvent::Error(err.to_string()));
                async {}
            });

        StreamChannel::open(self.inner.client.clone(), topic_url, handlers, self.inner.policy.clone())
    }

    pub fn active_topics(&self) -> Vec<String> {
        let topics = self.inner.topics.lock().unwrap_or_else(|e| e.into_inner());
        let mut urls: Vec<String> = topics.keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn subscriber_count(&self, topic_url: &str) -> usize {
        let topics = self.inner.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(topic_url).map_or(0, |t| t.refs)
    }
}

/// Releases one reference on a shared topic when dropped.
struct TopicRef {
    topic: String,
    broker: Arc<BrokerInner>,
}

impl Drop for TopicRef {
    fn drop(&mut self) {
        let mut topics = self.broker.topics.lock().unwrap_or_else(|e| e.into_inner());
        let last = match topics.get_mut(&self.topic) {
            Some(shared) => {
                shared.refs = shared.refs.saturating_sub(1);
                shared.refs == 0
            }
            None => false,
        };
        if last {
            if let Some(shared) = topics.remove(&self.topic) {
                info!("Last subscriber left {}, closing shared channel", self.topic);
                shared.handle.close_after(self.broker.close_grace);
            }
        }
    }
}

/// A local listener on a shared channel. Dropping it releases the reference.
pub struct BrokerSubscription {
    rx: broadcast::Receiver<ChannelEvent>,
    backlog: VecDeque<ChannelEvent>,
    lagged: u64,
    guard: TopicRef,
}

impl BrokerSubscription {
    fn new(rx: broadcast::Receiver<ChannelEvent>, backlog: VecDeque<ChannelEvent>, guard: TopicRef) -> Self {
        Self { rx, backlog, lagged: 0, guard }
    }

    pub fn topic(&self) -> &str {
        &self.guard.topic
    }

    /// Total events this listener lost by falling behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Next event, replayed backlog first. A listener that fell behind gets
    /// `ChannelEvent::Lagged` so it can resynchronize.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.lagged += n;
                warn!("Subscriber on {} lagged, {} event(s) lost", self.guard.topic, n);
                Some(ChannelEvent::Lagged(n))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Consume the subscription as a `Stream`, keeping the topic reference alive.
    pub fn into_stream(self) -> SubscriptionStream {
        SubscriptionStream {
            backlog: self.backlog,
            inner: Box::pin(BroadcastStream::new(self.rx)),
            guard: self.guard,
        }
    }
}

pub struct SubscriptionStream {
    backlog: VecDeque<ChannelEvent>,
    inner: Pin<Box<BroadcastStream<ChannelEvent>>>,
    guard: TopicRef,
}

impl Stream for SubscriptionStream {
    type Item = ChannelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.backlog.pop_front() {
            return Poll::Ready(Some(event));
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(event)),
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                warn!("Stream subscriber on {} lagged, {} event(s) lost", self.guard.topic, n);
                Poll::Ready(Some(ChannelEvent::Lagged(n)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn message(event: &str, n: i64) -> ChannelEvent {
        ChannelEvent::Message { event: event.to_string(), payload: json!(n) }
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn offline_broker() -> SubscriptionBroker {
        SubscriptionBroker::new(Client::new(), ReconnectPolicy::disabled(), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_refcounted_topic_lifecycle() {
        let broker = offline_broker();
        let url = "http://127.0.0.1:9/api/sse/platforms";

        let first = broker.subscribe(url, ["platform.update"]);
        let second = broker.subscribe(url, ["platform.update"]);
        assert_eq!(broker.subscriber_count(url), 2);
        assert_eq!(broker.active_topics(), vec![url.to_string()]);

        drop(first);
        assert_eq!(broker.subscriber_count(url), 1);
        drop(second);
        assert_eq!(broker.subscriber_count(url), 0);
        assert!(broker.active_topics().is_empty());
    }

    #[test]
    fn test_late_joiner_backlog_keeps_latest_per_event() {
        let feed = TopicFeed::new(16);
        feed.publish(ChannelEvent::Opened);
        feed.publish(message("snapshot", 1));
        feed.publish(message("update", 2));
        feed.publish(message("other", 3));
        feed.publish(message("update", 4));

        let (_rx, backlog) = feed.join(&names(&["snapshot", "update"]), true);
        assert_eq!(
            backlog.into_iter().collect::<Vec<_>>(),
            vec![ChannelEvent::Opened, message("snapshot", 1), message("update", 4)]
        );

        let (_rx, plain) = feed.join(&names(&["snapshot", "update"]), false);
        assert!(plain.is_empty());
    }

    #[test]
    fn test_backlog_omits_opened_after_error() {
        let feed = TopicFeed::new(16);
        feed.publish(ChannelEvent::Opened);
        feed.publish(message("snapshot", 1));
        feed.publish(ChannelEvent::Error("HTTP 500".into()));

        let (_rx, backlog) = feed.join(&names(&["snapshot"]), true);
        assert_eq!(backlog.into_iter().collect::<Vec<_>>(), vec![message("snapshot", 1)]);
    }

    #[tokio::test]
    async fn test_replayed_events_precede_live_ones() {
        let broker = offline_broker();
        let feed = TopicFeed::new(16);
        feed.publish(message("snapshot", 1));

        let (rx, backlog) = feed.join(&names(&["snapshot"]), true);
        let mut sub = BrokerSubscription::new(rx, backlog, broker.topic_ref("unregistered"));
        feed.publish(message("snapshot", 2));

        assert_eq!(sub.recv().await, Some(message("snapshot", 1)));
        assert_eq!(sub.recv().await, Some(message("snapshot", 2)));
    }

    #[tokio::test]
    async fn test_lagging_listener_is_told_how_much_it_lost() {
        let broker = offline_broker();
        let feed = TopicFeed::new(2);
        let (rx, backlog) = feed.join(&names(&["update"]), false);
        let mut sub = BrokerSubscription::new(rx, backlog, broker.topic_ref("unregistered"));

        for n in 1..=3 {
            feed.publish(message("update", n));
        }

        assert_eq!(sub.recv().await, Some(ChannelEvent::Lagged(1)));
        assert_eq!(sub.lagged(), 1);
        assert_eq!(sub.recv().await, Some(message("update", 2)));
        assert_eq!(sub.recv().await, Some(message("update", 3)));
    }

    #[tokio::test]
    async fn test_stream_reports_lag_after_backlog() {
        let broker = offline_broker();
        let feed = TopicFeed::new(2);
        feed.publish(message("snapshot", 0));
        let (rx, backlog) = feed.join(&names(&["snapshot", "update"]), true);
        let mut stream = BrokerSubscription::new(rx, backlog, broker.topic_ref("unregistered")).into_stream();

        for n in 1..=3 {
            feed.publish(message("update", n));
        }

        assert_eq!(stream.next().await, Some(message("snapshot", 0)));
        assert_eq!(stream.next().await, Some(ChannelEvent::Lagged(1)));
        assert_eq!(stream.next().await, Some(message("update", 2)));
    }
}
