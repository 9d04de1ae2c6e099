//! Subscription Module
//!
//! The consuming units: each one owns a broker subscription, the store it
//! feeds, and the background task doing the feeding. Failures end up in the
//! subscription's `LoadState`, never in the caller.

pub mod registry;
pub mod district;
pub mod history;

pub use registry::RegistrySubscription;
pub use district::{DistrictSnapshot, DistrictSubscription};
pub use history::{HistoryScope, HistorySubscription};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::task::AbortHandle;

/// Background tasks owned by one subscription, aborted together.
#[derive(Default)]
pub(crate) struct TaskSet {
    handles: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
}

impl TaskSet {
    pub(crate) fn push(&self, handle: AbortHandle) {
        if self.closed.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Abort every task. Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        for handle in self.handles.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            handle.abort();
        }
        true
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.close();
    }
}
