//! Runtime configuration
//!
//! Defaults match the dashboard backend's conventions; `.env` and
//! `AIRSTREAM_*` environment variables override them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::stream::ReconnectPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    #[serde(with = "duration_ms")]
    pub alert_cooldown: Duration,
    #[serde(with = "duration_ms")]
    pub history_timeout: Duration,
    /// The registry stream sends no snapshot, so it is declared ready after this delay.
    #[serde(with = "duration_ms")]
    pub registry_ready_fallback: Duration,
    /// Delay between a subscriber's teardown and the actual channel close.
    #[serde(with = "duration_ms")]
    pub close_grace: Duration,
    #[serde(with = "duration_ms")]
    pub grain: Duration,
    #[serde(with = "duration_ms")]
    pub search_debounce: Duration,
    pub search_min_chars: usize,
    pub search_limit: usize,
    pub geocoder_url: String,
    /// Appended to every geocoding query, e.g. ", Hanoi, Vietnam".
    pub geocoder_context: Option<String>,
    pub user_agent: String,
    pub reconnect: ReconnectPolicy,
    pub otlp_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8081".to_string(),
            alert_cooldown: Duration::from_secs(15 * 60),
            history_timeout: Duration::from_secs(30),
            registry_ready_fallback: Duration::from_secs(3),
            close_grace: Duration::from_millis(100),
            grain: Duration::from_secs(120),
            search_debounce: Duration::from_millis(300),
            search_min_chars: 3,
            search_limit: 5,
            geocoder_url: "https://nominatim.openstreetmap.org/search".to_string(),
            geocoder_context: None,
            user_agent: "airstream/0.2".to_string(),
            reconnect: ReconnectPolicy::default(),
            otlp_enabled: false,
        }
    }
}

impl Config {
    /// Load `.env` (if any) and apply `AIRSTREAM_*` overrides on top of the defaults.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        serde_yaml::from_str(&text).map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("AIRSTREAM_API_URL") {
            self.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("AIRSTREAM_ALERT_COOLDOWN_MS") {
            self.alert_cooldown = parse_millis("AIRSTREAM_ALERT_COOLDOWN_MS", &v)?;
        }
        if let Some(v) = lookup("AIRSTREAM_HISTORY_TIMEOUT_MS") {
            self.history_timeout = parse_millis("AIRSTREAM_HISTORY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("AIRSTREAM_GRAIN_MS") {
            self.grain = parse_millis("AIRSTREAM_GRAIN_MS", &v)?;
            if self.grain.is_zero() {
                return Err(SyncError::Config("AIRSTREAM_GRAIN_MS must be positive".into()));
            }
        }
        if let Some(v) = lookup("AIRSTREAM_SEARCH_DEBOUNCE_MS") {
            self.search_debounce = parse_millis("AIRSTREAM_SEARCH_DEBOUNCE_MS", &v)?;
        }
        if let Some(url) = lookup("AIRSTREAM_GEOCODER_URL") {
            self.geocoder_url = url;
        }
        if let Some(ctx) = lookup("AIRSTREAM_GEOCODER_CONTEXT") {
            self.geocoder_context = Some(ctx).filter(|c| !c.trim().is_empty());
        }
        if let Some(v) = lookup("AIRSTREAM_RECONNECT") {
            self.reconnect.enabled = parse_bool("AIRSTREAM_RECONNECT", &v)?;
        }
        if let Some(v) = lookup("AIRSTREAM_OTLP") {
            self.otlp_enabled = parse_bool("AIRSTREAM_OTLP", &v)?;
        }
        Ok(())
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| SyncError::Config(format!("{key}={raw}: {e}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SyncError::Config(format!("{key}={other}: expected a boolean"))),
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
