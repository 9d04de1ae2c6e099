//! Store Module
//!
//! In-memory views fed by event streams. Each store is owned by exactly one
//! subscriber; nothing here is a process-wide singleton.

mod entity;
mod history;

pub use entity::{EntityStateStore, UpsertOutcome};
pub use history::DistrictHistoryStore;

use serde::{Deserialize, Serialize};

/// Tri-state readiness exposed by every subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum LoadState {
    Loading,
    Ready,
    Error(String),
}

impl LoadState {
    pub fn is_ready(&self) -> bool {
        matches!(self, LoadState::Ready)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            LoadState::Error(message) => Some(message),
            _ => None,
        }
    }
}

impl Default for LoadState {
    fn default() -> Self {
        LoadState::Loading
    }
}
