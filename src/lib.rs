//! Airstream
//!
//! Client-side synchronization layer for a district air-quality and weather
//! telemetry backend:
//! - Server-sent event channels with reconnect supervision and shared topics
//! - Registry and history stores fed by those channels
//! - Cross-source time-series alignment and summary statistics
//! - Per-district alert throttling
//! - Debounced, race-free place search

pub mod config;
pub mod error;
pub mod models;
pub mod topics;
pub mod stream;
pub mod store;
pub mod timeseries;
pub mod alert;
pub mod search;
pub mod rest;
pub mod subscription;
pub mod telemetry;

// Re-exports for convenience
pub use alert::{AlertMonitor, AlertThrottle, ChannelNotifier, Notification, Notifier};
pub use config::Config;
pub use error::{ErrorKind, Result, SyncError};
pub use rest::{BackendClient, Geocoder, NominatimGeocoder, Suggestion};
pub use search::{SearchOptions, SuggestionSearch};
pub use store::{DistrictHistoryStore, EntityStateStore, LoadState};
pub use stream::{ReconnectPolicy, StreamChannel, SubscriptionBroker};
pub use subscription::{DistrictSubscription, HistoryScope, HistorySubscription, RegistrySubscription};
pub use timeseries::{stats, AlignedPoint, ScopeSelection, SeriesStats, TimeSeriesAligner};
pub use topics::{SourceKind, Topics};
