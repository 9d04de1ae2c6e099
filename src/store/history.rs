//! Per-scope history maps, replaced wholesale on every push

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use super::LoadState;
use crate::error::SyncError;
use crate::models::DistrictSeries;

#[derive(Debug, Clone, Default)]
pub struct DistrictHistoryStore {
    scopes: BTreeMap<String, DistrictSeries>,
    state: LoadState,
    loaded: bool,
}

impl DistrictHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap the whole map. There is no merge: scopes missing from `map` are
    /// gone afterwards. Returns the scopes that disappeared.
    pub fn replace_all(&mut self, map: BTreeMap<String, DistrictSeries>) -> Vec<String> {
        let dropped: Vec<String> = self
            .scopes
            .keys()
            .filter(|scope| !map.contains_key(*scope))
            .cloned()
            .collect();
        if !dropped.is_empty() {
            warn!("History push omitted {} previously known scope(s): {:?}", dropped.len(), dropped);
        }
        if !self.loaded {
            info!("History ready with {} scope(s)", map.len());
        }
        self.scopes = map;
        self.mark_loaded();
        dropped
    }

    /// Replace the single series for one scope (per-scope history streams).
    pub fn replace_scope(&mut self, scope: impl Into<String>, series: DistrictSeries) {
        self.scopes.insert(scope.into(), series);
        self.mark_loaded();
    }

    fn mark_loaded(&mut self) {
        self.loaded = true;
        self.state = LoadState::Ready;
    }

    pub fn get(&self) -> &BTreeMap<String, DistrictSeries> {
        &self.scopes
    }

    pub fn scope(&self, name: &str) -> Option<&DistrictSeries> {
        self.scopes.get(name)
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }

    pub fn has_loaded(&self) -> bool {
        self.loaded
    }

    /// Readiness deadline passed. Only an empty, never-loaded store turns
    /// into an error; returns whether it did.
    pub fn expire(&mut self, after: Duration) -> bool {
        if self.loaded {
            return false;
        }
        warn!("No history received after {:?}", after);
        self.state = LoadState::Error(SyncError::Timeout(after).to_string());
        true
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = LoadState::Error(message.into());
    }
}
