//! Per-district combined stream consumer

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::TaskSet;
use crate::error::{Result, SyncError};
use crate::models::{unwrap_envelope, AirQualityReading, WeatherReading};
use crate::store::LoadState;
use crate::stream::{ChannelEvent, SubscriptionBroker};
use crate::topics::{SourceKind, Topics};

/// Latest reading of each kind for one district.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DistrictSnapshot {
    pub weather: Option<WeatherReading>,
    pub air_quality: Option<AirQualityReading>,
}

impl DistrictSnapshot {
    /// Replace the reading for the kind named by `event`.
    pub fn apply(&mut self, event: &str, payload: Value) -> Result<SourceKind> {
        let payload = unwrap_envelope(payload);
        if event == SourceKind::Weather.update_event() {
            let reading = serde_json::from_value(payload).map_err(|e| SyncError::malformed(event, e))?;
            self.weather = Some(reading);
            Ok(SourceKind::Weather)
        } else if event == SourceKind::AirQuality.update_event() {
            let reading = serde_json::from_value(payload).map_err(|e| SyncError::malformed(event, e))?;
            self.air_quality = Some(reading);
            Ok(SourceKind::AirQuality)
        } else {
            Err(SyncError::malformed(event, "unexpected event on district stream"))
        }
    }
}

pub struct DistrictSubscription {
    scope: String,
    snapshot: Arc<RwLock<DistrictSnapshot>>,
    state: watch::Sender<LoadState>,
    tasks: TaskSet,
}

impl DistrictSubscription {
    pub fn start(broker: &SubscriptionBroker, topics: &Topics, scope: &str) -> Self {
        let snapshot = Arc::new(RwLock::new(DistrictSnapshot::default()));
        let (state, _) = watch::channel(LoadState::Loading);
        let tasks = TaskSet::default();

        let events = SourceKind::ALL.map(|kind| kind.update_event());
        let mut subscription = broker.subscribe_with_replay(&topics.district(scope), events);

        let feed_snapshot = snapshot.clone();
        let feed_state = state.clone();
        let feed_scope = scope.to_string();
        let feed = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match event {
                    ChannelEvent::Opened => info!("Connected to district stream {}", feed_scope),
                    ChannelEvent::Message { event, payload } => {
                        let applied = feed_snapshot.write().await.apply(&event, payload);
                        match applied {
                            Ok(kind) => {
                                debug!("{} reading updated for {}", kind, feed_scope);
                                feed_state.send_if_modified(|s| {
                                    let changed = !s.is_ready();
                                    *s = LoadState::Ready;
                                    changed
                                });
                            }
                            Err(e) => warn!("Dropping district event: {}", e),
                        }
                    }
                    ChannelEvent::Error(reason) => {
                        warn!("District stream {} error: {}", feed_scope, reason);
                        feed_state.send_replace(LoadState::Error(reason));
                    }
                    ChannelEvent::Lagged(n) => warn!("District stream {} skipped {} reading(s)", feed_scope, n),
                }
            }
        });
        tasks.push(feed.abort_handle());

        Self { scope: scope.to_string(), snapshot, state, tasks }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub async fn snapshot(&self) -> DistrictSnapshot {
        self.snapshot.read().await.clone()
    }

    pub fn state(&self) -> LoadState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    pub fn close(&self) {
        if self.tasks.close() {
            info!("District subscription {} closed", self.scope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AqiLevel;
    use serde_json::json;

    #[test]
    fn test_snapshot_keeps_latest_per_kind() {
        let mut snapshot = DistrictSnapshot::default();
        snapshot.apply("weather.update", json!({"temperature": 28.5, "district": "HoanKiem"})).unwrap();
        snapshot.apply("airquality.update", json!({"airQualityIndex": 4, "pm2_5": 61.2})).unwrap();
        snapshot.apply("weather.update", json!({"temperature": 29.0})).unwrap();

        assert_eq!(snapshot.weather.as_ref().unwrap().temperature, Some(29.0));
        let air = snapshot.air_quality.as_ref().unwrap();
        assert_eq!(air.level(), Some(AqiLevel::Poor));
        assert_eq!(air.pm2_5, Some(61.2));
    }

    #[test]
    fn test_snapshot_unwraps_envelope_and_rejects_unknown_event() {
        let mut snapshot = DistrictSnapshot::default();
        let wrapped = json!({"eventType": "weather.update", "data": {"temperature": 30.0}});
        assert_eq!(snapshot.apply("weather.update", wrapped).unwrap(), SourceKind::Weather);
        assert_eq!(snapshot.weather.as_ref().unwrap().temperature, Some(30.0));

        assert!(snapshot.apply("device.update", json!({})).is_err());
        assert!(snapshot.apply("airquality.update", json!({"pm10": "high"})).is_err());
    }
}
