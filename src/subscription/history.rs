//! History stream consumer
//!
//! Aggregated streams push the full `{scope: series}` map, both as the
//! initial snapshot and on every update, and each push replaces the store
//! wholesale. Per-scope streams push a single series for one district.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::TaskSet;
use crate::error::Result;
use crate::models::{decode_series, decode_series_map, DistrictSeries};
use crate::store::{DistrictHistoryStore, LoadState};
use crate::stream::{ChannelEvent, SubscriptionBroker};
use crate::topics::{SourceKind, Topics};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryScope {
    /// Every district at once.
    Aggregated,
    /// One district.
    Scope(String),
}

impl HistoryScope {
    fn topic(&self, topics: &Topics, kind: SourceKind) -> String {
        match self {
            HistoryScope::Aggregated => topics.aggregated_history(kind),
            HistoryScope::Scope(scope) => topics.scope_history(kind, scope),
        }
    }

    fn events(&self, kind: SourceKind) -> [String; 2] {
        match self {
            HistoryScope::Aggregated => [kind.aggregated_event(), kind.aggregated_update_event()],
            HistoryScope::Scope(_) => [kind.history_event(), kind.history_update_event()],
        }
    }

    /// Decode one push and apply it to `store`.
    pub fn apply(&self, store: &mut DistrictHistoryStore, payload: Value) -> Result<()> {
        match self {
            HistoryScope::Aggregated => {
                store.replace_all(decode_series_map(payload)?);
            }
            HistoryScope::Scope(scope) => {
                store.replace_scope(scope.clone(), decode_series(payload)?);
            }
        }
        Ok(())
    }
}

pub struct HistorySubscription {
    kind: SourceKind,
    scope: HistoryScope,
    store: Arc<RwLock<DistrictHistoryStore>>,
    state: watch::Sender<LoadState>,
    tasks: TaskSet,
}

impl HistorySubscription {
    /// Subscribe and arm the readiness guard: if nothing has loaded after
    /// `timeout` the state turns to `Error`.
    pub fn start(
        broker: &SubscriptionBroker,
        topics: &Topics,
        kind: SourceKind,
        scope: HistoryScope,
        timeout: Duration,
    ) -> Self {
        let store = Arc::new(RwLock::new(DistrictHistoryStore::new()));
        let (state, _) = watch::channel(LoadState::Loading);
        let tasks = TaskSet::default();

        let topic = scope.topic(topics, kind);
        let mut subscription = broker.subscribe_with_replay(&topic, scope.events(kind));

        let guard_store = store.clone();
        let guard_state = state.clone();
        let guard = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut store = guard_store.write().await;
            if store.expire(timeout) {
                guard_state.send_replace(store.state().clone());
            }
        });
        let guard_handle = guard.abort_handle();
        tasks.push(guard_handle.clone());

        let feed_store = store.clone();
        let feed_state = state.clone();
        let feed_scope = scope.clone();
        let feed = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match event {
                    ChannelEvent::Opened => info!("Connected to {} history stream {}", kind, topic),
                    ChannelEvent::Message { event, payload } => {
                        let mut store = feed_store.write().await;
                        match feed_scope.apply(&mut store, payload) {
                            Ok(()) => {
                                guard_handle.abort();
                                debug!("Applied '{}' ({} scope(s) held)", event, store.get().len());
                                feed_state.send_replace(store.state().clone());
                            }
                            Err(e) => warn!("Dropping {} history event: {}", kind, e),
                        }
                    }
                    ChannelEvent::Error(reason) => {
                        warn!("{} history stream error: {}", kind, reason);
                        let mut store = feed_store.write().await;
                        store.fail(reason);
                        feed_state.send_replace(store.state().clone());
                    }
                    // Every push is a full replacement, so the next one resynchronizes.
                    ChannelEvent::Lagged(n) => warn!("{} history stream skipped {} push(es)", kind, n),
                }
            }
        });
        tasks.push(feed.abort_handle());

        Self { kind, scope, store, state, tasks }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn scope(&self) -> &HistoryScope {
        &self.scope
    }

    pub async fn snapshot(&self) -> BTreeMap<String, DistrictSeries> {
        self.store.read().await.get().clone()
    }

    pub fn state(&self) -> LoadState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    pub fn close(&self) {
        if self.tasks.close() {
            info!("{} history subscription closed", self.kind);
        }
    }
}
