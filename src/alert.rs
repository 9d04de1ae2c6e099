//! Alert throttling and notification
//!
//! The backend pushes an alert every time a district crosses its threshold,
//! which can be every few seconds. `AlertThrottle` lets at most one
//! notification per scope through per cooldown window.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::models::{AlertEvent, AqiLevel};
use crate::stream::{ChannelEvent, SubscriptionBroker};
use crate::topics::{SourceKind, Topics};

/// Per-scope cooldown. State lives only as long as the instance.
#[derive(Debug, Clone)]
pub struct AlertThrottle {
    cooldown: Duration,
    last_notified: HashMap<String, i64>,
}

impl AlertThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown, last_notified: HashMap::new() }
    }

    /// True if `scope` was never notified or its last notification is at
    /// least `cooldown_ms` old. A `true` answer records `now_ms`.
    pub fn should_notify(&mut self, scope: &str, now_ms: i64, cooldown_ms: i64) -> bool {
        let allowed = match self.last_notified.get(scope) {
            Some(last) => now_ms - last >= cooldown_ms,
            None => true,
        };
        if allowed {
            self.last_notified.insert(scope.to_string(), now_ms);
        }
        allowed
    }

    /// [`should_notify`](Self::should_notify) with the configured cooldown.
    pub fn check(&mut self, scope: &str, now_ms: i64) -> bool {
        let cooldown_ms = i64::try_from(self.cooldown.as_millis()).unwrap_or(i64::MAX);
        self.should_notify(scope, now_ms, cooldown_ms)
    }

    pub fn last_notified(&self, scope: &str) -> Option<i64> {
        self.last_notified.get(scope).copied()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn reset(&mut self) {
        self.last_notified.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub scope: String,
    pub kind: SourceKind,
    pub index: Option<u8>,
    pub level: Option<AqiLevel>,
    pub message: String,
}

impl Notification {
    pub fn from_alert(kind: SourceKind, alert: &AlertEvent) -> Self {
        let index = alert.index_value();
        let level = alert.level();
        let message = match (kind, level, index) {
            (SourceKind::AirQuality, Some(level), Some(index)) => {
                format!("Air quality in {} is {} (AQI {})", alert.scope, level.label(), index)
            }
            _ => format!("{} alert for {}", kind, alert.scope),
        };
        Self { scope: alert.scope.clone(), kind, index, level, message }
    }
}

/// Where throttled alerts end up.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Forwards notifications to an unbounded channel.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.tx
            .send(notification)
            .map_err(|_| SyncError::Notification("receiver dropped".to_string()))
    }
}

/// Writes notifications to the log.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        warn!(scope = %notification.scope, "ALERT: {}", notification.message);
        Ok(())
    }
}

/// Decode one alert payload and run it through the throttle.
pub fn evaluate_alert(
    throttle: &mut AlertThrottle,
    kind: SourceKind,
    payload: serde_json::Value,
    now_ms: i64,
) -> Result<Option<Notification>> {
    let alert = AlertEvent::from_value(payload)?;
    if !throttle.check(&alert.scope, now_ms) {
        debug!("Alert for {} suppressed by cooldown", alert.scope);
        return Ok(None);
    }
    Ok(Some(Notification::from_alert(kind, &alert)))
}

/// Watches the global alert stream of one source kind.
pub struct AlertMonitor {
    task: JoinHandle<()>,
    throttle: Arc<Mutex<AlertThrottle>>,
    closed: AtomicBool,
}

impl AlertMonitor {
    pub fn start(
        broker: &SubscriptionBroker,
        topics: &Topics,
        kind: SourceKind,
        cooldown: Duration,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let throttle = Arc::new(Mutex::new(AlertThrottle::new(cooldown)));
        let mut subscription = broker.subscribe(&topics.alerts(kind), [kind.alert_event()]);
        let task_throttle = throttle.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match event {
                    ChannelEvent::Opened => info!("Connected to {} alert stream", kind),
                    ChannelEvent::Error(reason) => warn!("{} alert stream error: {}", kind, reason),
                    ChannelEvent::Lagged(n) => warn!("{} alert stream skipped {} alert(s)", kind, n),
                    ChannelEvent::Message { payload, .. } => {
                        let verdict = {
                            let mut throttle = task_throttle.lock().unwrap_or_else(|e| e.into_inner());
                            evaluate_alert(&mut throttle, kind, payload, Utc::now().timestamp_millis())
                        };
                        match verdict {
                            Ok(Some(notification)) => {
                                if let Err(e) = notifier.notify(notification).await {
                                    warn!("Failed to deliver alert notification: {}", e);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Dropping malformed alert: {}", e),
                        }
                    }
                }
            }
        });

        Self { task, throttle, closed: AtomicBool::new(false) }
    }

    pub fn last_notified(&self, scope: &str) -> Option<i64> {
        self.throttle.lock().unwrap_or_else(|e| e.into_inner()).last_notified(scope)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.task.abort();
    }
}

impl Drop for AlertMonitor {
    fn drop(&mut self) {
        self.close();
    }
}
