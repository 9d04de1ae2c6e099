//! Debounced place search
//!
//! Keystrokes restart a debounce timer; when it fires one geocoding query
//! goes out tagged with a sequence number. Only the response to the most
//! recently issued query may update the suggestions.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::config::Config;
use crate::rest::{Geocoder, Suggestion};

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub debounce: Duration,
    pub min_chars: usize,
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { debounce: Duration::from_millis(300), min_chars: 3, limit: 5 }
    }
}

impl From<&Config> for SearchOptions {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.search_debounce,
            min_chars: config.search_min_chars,
            limit: config.search_limit,
        }
    }
}

#[derive(Default)]
struct SearchState {
    issued: u64,
    pending: Option<AbortHandle>,
    last_error: Option<String>,
}

struct SearchInner {
    geocoder: Arc<dyn Geocoder>,
    options: SearchOptions,
    state: Mutex<SearchState>,
    suggestions: watch::Sender<Vec<Suggestion>>,
}

impl SearchInner {
    fn issue(self: &Arc<Self>, query: String) -> JoinHandle<bool> {
        let seq = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.issued += 1;
            state.issued
        };
        debug!("Issuing search #{} for '{}'", seq, query);

        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.geocoder.search(&query, inner.options.limit).await;
            inner.apply(seq, result)
        })
    }

    fn apply(&self, seq: u64, result: crate::error::Result<Vec<Suggestion>>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if seq != state.issued {
            debug!("Discarding stale search response #{} (latest #{})", seq, state.issued);
            return false;
        }
        match result {
            Ok(found) => {
                state.last_error = None;
                self.suggestions.send_replace(found);
            }
            Err(e) => {
                warn!("Search #{} failed: {}", seq, e);
                state.last_error = Some(e.to_string());
                self.suggestions.send_replace(Vec::new());
            }
        }
        true
    }
}

/// Owned per input field; dropping it cancels any pending timer.
pub struct SuggestionSearch {
    inner: Arc<SearchInner>,
}

impl SuggestionSearch {
    pub fn new(geocoder: Arc<dyn Geocoder>, options: SearchOptions) -> Self {
        let (suggestions, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(SearchInner {
                geocoder,
                options,
                state: Mutex::new(SearchState::default()),
                suggestions,
            }),
        }
    }

    /// Handle one keystroke worth of input.
    pub fn input(&self, text: &str) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }

        let query = text.trim().to_string();
        if query.chars().count() < self.inner.options.min_chars {
            // Also invalidates any query still in flight.
            state.issued += 1;
            state.last_error = None;
            self.inner.suggestions.send_replace(Vec::new());
            return;
        }

        let inner = self.inner.clone();
        let debounce = self.inner.options.debounce;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            inner.issue(query);
        });
        state.pending = Some(timer.abort_handle());
    }

    /// Send a query right away, bypassing the debounce timer. The handle
    /// resolves to whether the response was applied.
    pub fn issue_query(&self, query: impl Into<String>) -> JoinHandle<bool> {
        self.inner.issue(query.into())
    }

    /// Submit a complete query, as when the user presses enter: any pending
    /// keystroke timer is dropped and the query goes out at once. Input
    /// below `min_chars` clears the suggestions without a request. Resolves
    /// to whether the response was applied.
    pub async fn submit(&self, text: &str) -> bool {
        let query = text.trim().to_string();
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
            if query.chars().count() < self.inner.options.min_chars {
                state.issued += 1;
                state.last_error = None;
                self.inner.suggestions.send_replace(Vec::new());
                return false;
            }
        }
        match self.inner.issue(query).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!("Search task failed: {}", e);
                false
            }
        }
    }

    pub fn min_chars(&self) -> usize {
        self.inner.options.min_chars
    }

    pub fn suggestions(&self) -> Vec<Suggestion> {
        self.inner.suggestions.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Suggestion>> {
        self.inner.suggestions.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).last_error.clone()
    }

    /// Sequence number of the most recently issued query.
    pub fn latest_sequence(&self) -> u64 {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).issued
    }

    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
    }
}

impl Drop for SuggestionSearch {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SyncError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::oneshot;

    fn suggestion(name: &str) -> Suggestion {
        Suggestion { display_name: name.to_string(), lat: 21.0, lon: 105.8 }
    }

    #[derive(Default)]
    struct RecordingGeocoder {
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Geocoder for RecordingGeocoder {
        async fn search(&self, query: &str, _limit: usize) -> Result<Vec<Suggestion>> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(vec![suggestion(query)])
        }
    }

    /// Each query blocks until the test releases its response.
    #[derive(Default)]
    struct GatedGeocoder {
        gates: Mutex<HashMap<String, oneshot::Receiver<Vec<Suggestion>>>>,
    }

    impl GatedGeocoder {
        fn gate(&self, query: &str) -> oneshot::Sender<Vec<Suggestion>> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().insert(query.to_string(), rx);
            tx
        }
    }

    #[async_trait]
    impl Geocoder for GatedGeocoder {
        async fn search(&self, query: &str, _limit: usize) -> Result<Vec<Suggestion>> {
            let rx = self.gates.lock().unwrap().remove(query);
            match rx {
                Some(rx) => rx.await.map_err(|e| SyncError::Geocoding(e.to_string())),
                None => Err(SyncError::Geocoding(format!("no gate for {query}"))),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_keystrokes() {
        let geocoder = Arc::new(RecordingGeocoder::default());
        let search = SuggestionSearch::new(geocoder.clone(), SearchOptions::default());
        let mut rx = search.watch();

        search.input("h");
        search.input("ho");
        search.input("hoa");
        tokio::time::sleep(Duration::from_millis(100)).await;
        search.input("hoan");

        rx.changed().await.unwrap();
        assert_eq!(*geocoder.queries.lock().unwrap(), vec!["hoan".to_string()]);
        assert_eq!(search.suggestions(), vec![suggestion("hoan")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_input_clears_and_cancels() {
        let geocoder = Arc::new(RecordingGeocoder::default());
        let search = SuggestionSearch::new(geocoder.clone(), SearchOptions::default());
        let mut rx = search.watch();

        search.input("hoan kiem");
        rx.changed().await.unwrap();
        assert_eq!(search.suggestions().len(), 1);

        search.input("hoan");
        search.input("ho");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(search.suggestions().is_empty());
        assert_eq!(geocoder.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_response_is_discarded() {
        let geocoder = Arc::new(GatedGeocoder::default());
        let first_gate = geocoder.gate("hoan");
        let second_gate = geocoder.gate("hoan kiem");
        let search = SuggestionSearch::new(geocoder.clone(), SearchOptions::default());

        let first = search.issue_query("hoan");
        let second = search.issue_query("hoan kiem");
        assert_eq!(search.latest_sequence(), 2);

        second_gate.send(vec![suggestion("Hoan Kiem Lake")]).unwrap();
        assert!(second.await.unwrap());

        first_gate.send(vec![suggestion("Hoang Mai")]).unwrap();
        assert!(!first.await.unwrap());

        assert_eq!(search.suggestions(), vec![suggestion("Hoan Kiem Lake")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_cancels_pending_keystroke() {
        let geocoder = Arc::new(RecordingGeocoder::default());
        let search = SuggestionSearch::new(geocoder.clone(), SearchOptions::default());

        search.input("hoa");
        assert!(search.submit("  hoan kiem ").await);
        assert_eq!(search.suggestions(), vec![suggestion("hoan kiem")]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*geocoder.queries.lock().unwrap(), vec!["hoan kiem".to_string()]);

        assert!(!search.submit("ho").await);
        assert!(search.suggestions().is_empty());
        assert_eq!(geocoder.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_query_clears_suggestions() {
        let geocoder = Arc::new(GatedGeocoder::default());
        let search = SuggestionSearch::new(geocoder, SearchOptions::default());

        assert!(search.issue_query("ungated").await.unwrap());
        assert!(search.suggestions().is_empty());
        assert!(search.last_error().unwrap().contains("ungated"));
    }
}
