//! Registry stream consumer

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::TaskSet;
use crate::models::Entity;
use crate::rest::BackendClient;
use crate::store::{EntityStateStore, LoadState};
use crate::stream::{ChannelEvent, SubscriptionBroker};
use crate::topics::{Topics, PLATFORM_UPDATE};

/// Live view of the platform registry.
///
/// The stream only carries single-entity updates, so an optional REST seed
/// fills the store first. With no seed and no updates the subscription
/// declares itself ready after `ready_fallback`.
pub struct RegistrySubscription {
    store: Arc<RwLock<EntityStateStore>>,
    state: watch::Sender<LoadState>,
    tasks: TaskSet,
}

/// Upsert every platform the REST endpoint knows about.
async fn seed_store(client: &BackendClient, store: &RwLock<EntityStateStore>, state: &watch::Sender<LoadState>) {
    match client.fetch_platforms().await {
        Ok(entities) => {
            let mut store = store.write().await;
            for entity in entities {
                store.upsert(entity);
            }
            info!("Seeded registry with {} platform(s)", store.len());
            state.send_replace(LoadState::Ready);
        }
        Err(e) => warn!("Registry seed failed, relying on stream: {}", e),
    }
}

impl RegistrySubscription {
    pub fn start(
        broker: &SubscriptionBroker,
        topics: &Topics,
        seed: Option<BackendClient>,
        ready_fallback: Duration,
    ) -> Self {
        let store = Arc::new(RwLock::new(EntityStateStore::new()));
        let (state, _) = watch::channel(LoadState::Loading);
        let tasks = TaskSet::default();

        let mut subscription = broker.subscribe(&topics.platforms(), [PLATFORM_UPDATE]);

        let feed_store = store.clone();
        let feed_state = state.clone();
        let feed = tokio::spawn(async move {
            if let Some(client) = &seed {
                seed_store(client, &feed_store, &feed_state).await;
            }

            while let Some(event) = subscription.recv().await {
                match event {
                    ChannelEvent::Opened => {
                        info!("Connected to registry stream");
                        feed_state.send_if_modified(|s| {
                            if s.error().is_some() {
                                *s = LoadState::Ready;
                                true
                            } else {
                                false
                            }
                        });
                    }
                    ChannelEvent::Message { payload, .. } => {
                        let outcome = feed_store.write().await.upsert_value(payload);
                        match outcome {
                            Ok(outcome) => {
                                debug!("Registry update: {:?}", outcome);
                                feed_state.send_if_modified(|s| {
                                    let changed = !s.is_ready();
                                    *s = LoadState::Ready;
                                    changed
                                });
                            }
                            Err(e) => warn!("Dropping registry update: {}", e),
                        }
                    }
                    ChannelEvent::Error(reason) => {
                        warn!("Registry stream error: {}", reason);
                        feed_state.send_replace(LoadState::Error(reason));
                    }
                    // Skipped updates are incremental, so only a full fetch recovers them.
                    ChannelEvent::Lagged(n) => match &seed {
                        Some(client) => {
                            info!("Registry stream lagged by {} update(s), re-seeding", n);
                            seed_store(client, &feed_store, &feed_state).await;
                        }
                        None => warn!("Registry stream lagged, {} update(s) lost", n),
                    },
                }
            }
        });
        tasks.push(feed.abort_handle());

        let fallback_state = state.clone();
        let fallback = tokio::spawn(async move {
            tokio::time::sleep(ready_fallback).await;
            fallback_state.send_if_modified(|s| {
                if matches!(s, LoadState::Loading) {
                    debug!("Registry ready by fallback after {:?}", ready_fallback);
                    *s = LoadState::Ready;
                    true
                } else {
                    false
                }
            });
        });
        tasks.push(fallback.abort_handle());

        Self { store, state, tasks }
    }

    pub async fn entities(&self) -> Vec<Entity> {
        self.store.read().await.list().to_vec()
    }

    pub async fn entity(&self, id: &str) -> Option<Entity> {
        self.store.read().await.get(id).cloned()
    }

    pub fn state(&self) -> LoadState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    /// Stop consuming. Safe to call more than once.
    pub fn close(&self) {
        if self.tasks.close() {
            info!("Registry subscription closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tasks.is_closed()
    }
}
