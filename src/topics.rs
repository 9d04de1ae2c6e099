//! Topic URLs and event names published by the telemetry backend

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two time-series source kinds the backend streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "weather")]
    Weather,
    #[serde(rename = "airquality")]
    AirQuality,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Weather, SourceKind::AirQuality];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Weather => "weather",
            SourceKind::AirQuality => "airquality",
        }
    }

    pub fn update_event(&self) -> String {
        format!("{}.update", self.as_str())
    }

    pub fn alert_event(&self) -> String {
        format!("{}.alert", self.as_str())
    }

    pub fn history_event(&self) -> String {
        format!("{}.history", self.as_str())
    }

    pub fn history_update_event(&self) -> String {
        format!("{}.history.update", self.as_str())
    }

    pub fn aggregated_event(&self) -> String {
        format!("{}.history.aggregated", self.as_str())
    }

    pub fn aggregated_update_event(&self) -> String {
        format!("{}.history.aggregated.update", self.as_str())
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weather" => Ok(SourceKind::Weather),
            "airquality" | "air_quality" | "aq" => Ok(SourceKind::AirQuality),
            other => Err(format!("unknown source kind '{other}'")),
        }
    }
}

pub const PLATFORM_UPDATE: &str = "platform.update";
pub const DEVICE_UPDATE: &str = "device.update";

/// Sentinel scope meaning every known district combined.
pub const ALL_SCOPES: &str = "all";

/// Builds topic and REST URLs against one backend base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base: String = base_url.into();
        Self { base: base.trim_end_matches('/').to_string() }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn platforms(&self) -> String {
        format!("{}/api/sse/platforms", self.base)
    }

    pub fn platform(&self, platform_id: &str) -> String {
        format!("{}/api/sse/platform/{}", self.base, urlencoding::encode(platform_id))
    }

    pub fn device(&self, device_id: &str) -> String {
        format!("{}/api/sse/device/{}", self.base, urlencoding::encode(device_id))
    }

    /// Combined weather + air-quality stream for one district.
    pub fn district(&self, scope: &str) -> String {
        format!("{}/api/sse/district/{}", self.base, urlencoding::encode(scope))
    }

    pub fn alerts(&self, kind: SourceKind) -> String {
        format!("{}/api/sse/{}/alerts", self.base, kind)
    }

    pub fn scope_history(&self, kind: SourceKind, scope: &str) -> String {
        format!("{}/api/sse/{}/{}/history", self.base, kind, urlencoding::encode(scope))
    }

    pub fn aggregated_history(&self, kind: SourceKind) -> String {
        format!("{}/api/sse/{}/{}/history", self.base, kind, ALL_SCOPES)
    }

    pub fn platforms_rest(&self) -> String {
        format!("{}/api/platforms", self.base)
    }

    pub fn platform_devices_rest(&self, platform_id: &str) -> String {
        format!("{}/api/platforms/{}/devices", self.base, urlencoding::encode(platform_id))
    }
}
