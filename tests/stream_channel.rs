//! End-to-end channel behaviour over a real HTTP event stream.

mod common;

use airstream::stream::{ChannelEvent, EventHandlers, ReconnectPolicy, StreamChannel, SubscriptionBroker};
use airstream::SyncError;
use common::{wait_until, TestBackend};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_retry(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: false,
        max_attempts: Some(max_attempts),
        ..ReconnectPolicy::default()
    }
}

#[tokio::test]
async fn test_events_dispatch_in_order_and_malformed_are_dropped() {
    let backend = TestBackend::start().await;
    let received: Arc<Mutex<Vec<Value>>> = Arc::default();

    let sink = received.clone();
    let handlers = EventHandlers::new().on("platform.update", move |payload| {
        sink.lock().unwrap().push(payload);
        async { Ok(()) }
    });
    let handle = StreamChannel::open(
        reqwest::Client::new(),
        format!("{}/api/sse/platforms", backend.base_url),
        handlers,
        ReconnectPolicy::disabled(),
    );
    backend.wait_for_clients("platforms", 1).await;

    backend.push("platforms", "platform.update", json!({"entityId": "p1"}));
    backend.push_raw("platforms", "platform.update", "{not json");
    backend.push("platforms", "device.update", json!({"entityId": "d1"}));
    backend.push("platforms", "platform.update", json!({"entityId": "p2"}));

    wait_until(|| received.lock().unwrap().len() == 2).await;
    let ids: Vec<_> = received.lock().unwrap().iter().map(|v| v["entityId"].clone()).collect();
    assert_eq!(ids, vec![json!("p1"), json!("p2")]);

    wait_until(|| handle.stats().ignored.load(Ordering::Relaxed) == 1).await;
    assert_eq!(handle.stats().dropped.load(Ordering::Relaxed), 1);
    assert_eq!(handle.stats().dispatched.load(Ordering::Relaxed), 2);

    handle.close();
    handle.close();
    assert!(handle.is_closed());
}

#[tokio::test]
async fn test_failed_connect_reports_error_and_retries_within_budget() {
    let backend = TestBackend::start().await;
    let errors = Arc::new(AtomicUsize::new(0));
    let opened = Arc::new(AtomicUsize::new(0));

    let error_count = errors.clone();
    let open_count = opened.clone();
    let handlers = EventHandlers::new()
        .on("weather.update", |_| async { Ok(()) })
        .on_open(move || {
            open_count.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .on_error(move |err: SyncError| {
            assert_eq!(err.kind(), airstream::ErrorKind::Connection);
            error_count.fetch_add(1, Ordering::SeqCst);
            async {}
        });

    let handle = StreamChannel::open(
        reqwest::Client::new(),
        format!("{}/api/sse/broken/district", backend.base_url),
        handlers,
        fast_retry(3),
    );

    wait_until(|| errors.load(Ordering::SeqCst) == 3).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(errors.load(Ordering::SeqCst), 3);
    assert_eq!(backend.connections("broken/district"), 3);
    assert_eq!(opened.load(Ordering::SeqCst), 0);
    assert_eq!(handle.stats().failures.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn test_broker_shares_one_connection_per_topic() {
    let backend = TestBackend::start().await;
    let broker = SubscriptionBroker::new(reqwest::Client::new(), ReconnectPolicy::disabled(), Duration::from_millis(20));
    let url = format!("{}/api/sse/airquality/alerts", backend.base_url);

    let mut first = broker.subscribe(&url, ["airquality.alert"]);
    let mut second = broker.subscribe(&url, ["airquality.alert"]);
    assert_eq!(broker.subscriber_count(&url), 2);

    assert_eq!(first.recv().await, Some(ChannelEvent::Opened));
    assert_eq!(second.recv().await, Some(ChannelEvent::Opened));
    backend.wait_for_clients("airquality/alerts", 1).await;

    backend.push("airquality/alerts", "airquality.alert", json!({"district": "D1", "data": {"airQualityIndex": 4}}));

    for sub in [&mut first, &mut second] {
        match sub.recv().await {
            Some(ChannelEvent::Message { event, payload }) => {
                assert_eq!(event, "airquality.alert");
                assert_eq!(payload["district"], "D1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(backend.connections("airquality/alerts"), 1);

    drop(first);
    drop(second);
    assert!(broker.active_topics().is_empty());
}
