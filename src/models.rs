//! Wire records pushed by the telemetry backend

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

pub type Timestamp = DateTime<Utc>;

/// Strip `{eventType, data}` envelopes (the backend nests them up to twice)
/// down to the innermost payload.
pub fn unwrap_envelope(mut value: Value) -> Value {
    loop {
        let is_envelope = value
            .as_object()
            .map_or(false, |o| o.contains_key("eventType") && o.contains_key("data"));
        if !is_envelope {
            return value;
        }
        value = value
            .as_object_mut()
            .and_then(|o| o.remove("data"))
            .unwrap_or(Value::Null);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude", alias = "lng")]
    pub lon: f64,
}

/// A registry entity (monitoring platform / station), unique by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<Value>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub status: Option<String>,
    /// Every other attribute the backend sends, kept verbatim.
    #[serde(flatten)]
    pub attrs: Map<String, Value>,
}

impl Entity {
    /// Validate and decode one entity payload. The backend names the key
    /// `entityId`; `id` is accepted as well.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = unwrap_envelope(value) else {
            return Err(SyncError::MalformedEntity("payload is not an object".into()));
        };
        if !obj.contains_key("id") {
            if let Some(id) = obj.remove("entityId") {
                obj.insert("id".to_string(), id);
            }
        }
        match obj.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => {}
            Some(_) => return Err(SyncError::MalformedEntity("id is not a non-empty string".into())),
            None => return Err(SyncError::MalformedEntity("missing id".into())),
        }
        serde_json::from_value(Value::Object(obj)).map_err(|e| SyncError::MalformedEntity(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesAttribute {
    #[serde(rename = "attrName")]
    pub attr_name: String,
    pub values: Vec<Option<f64>>,
}

/// Raw time-series for one district. `index` is not assumed sorted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DistrictSeries {
    #[serde(deserialize_with = "deserialize_timestamps")]
    pub index: Vec<Timestamp>,
    #[serde(default)]
    pub attributes: Vec<SeriesAttribute>,
}

impl DistrictSeries {
    pub fn validate(&self) -> Result<()> {
        for attr in &self.attributes {
            if attr.values.len() != self.index.len() {
                return Err(SyncError::malformed(
                    "history",
                    format!(
                        "attribute '{}' has {} values for {} timestamps",
                        attr.attr_name,
                        attr.values.len(),
                        self.index.len()
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn attribute(&self, name: &str) -> Option<&SeriesAttribute> {
        self.attributes.iter().find(|a| a.attr_name == name)
    }
}

/// Decode a `{scope: DistrictSeries}` map and validate every series.
pub fn decode_series_map(value: Value) -> Result<std::collections::BTreeMap<String, DistrictSeries>> {
    let map: std::collections::BTreeMap<String, DistrictSeries> =
        serde_json::from_value(unwrap_envelope(value)).map_err(|e| SyncError::malformed("history", e))?;
    for (scope, series) in &map {
        series
            .validate()
            .map_err(|e| SyncError::malformed("history", format!("{scope}: {e}")))?;
    }
    Ok(map)
}

pub fn decode_series(value: Value) -> Result<DistrictSeries> {
    let series: DistrictSeries =
        serde_json::from_value(unwrap_envelope(value)).map_err(|e| SyncError::malformed("history", e))?;
    series.validate()?;
    Ok(series)
}

fn parse_timestamp(raw: &Value) -> std::result::Result<Timestamp, String> {
    match raw {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Ok(Utc.from_utc_datetime(&naive));
                }
            }
            Err(format!("unparseable timestamp '{s}'"))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| format!("timestamp {n} out of range")),
        other => Err(format!("unexpected timestamp {other}")),
    }
}

fn deserialize_timestamps<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<Timestamp>, D::Error> {
    let raw = Vec::<Value>::deserialize(deserializer)?;
    raw.iter()
        .map(|v| parse_timestamp(v).map_err(serde::de::Error::custom))
        .collect()
}

/// Categorical air-quality index tier (1 = good .. 5 = very poor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AqiLevel {
    Good = 1,
    Fair = 2,
    Moderate = 3,
    Poor = 4,
    VeryPoor = 5,
}

impl AqiLevel {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(Self::Good),
            2 => Some(Self::Fair),
            3 => Some(Self::Moderate),
            4 => Some(Self::Poor),
            5 => Some(Self::VeryPoor),
            _ => None,
        }
    }

    pub fn index(&self) -> u8 {
        *self as u8
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Moderate => "moderate",
            Self::Poor => "poor",
            Self::VeryPoor => "very poor",
        }
    }

    /// The backend only pushes alerts from `Poor` upward.
    pub fn is_alerting(&self) -> bool {
        *self >= Self::Poor
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherReading {
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub station_name: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub observed_at: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub feels_like_temperature: Option<f64>,
    #[serde(default)]
    pub relative_humidity: Option<f64>,
    #[serde(default)]
    pub atmospheric_pressure: Option<f64>,
    #[serde(default)]
    pub weather_type: Option<String>,
    #[serde(default)]
    pub weather_description: Option<String>,
    #[serde(default)]
    pub wind_speed: Option<f64>,
    #[serde(default)]
    pub wind_direction: Option<f64>,
    #[serde(default)]
    pub precipitation: Option<f64>,
    #[serde(default)]
    pub visibility: Option<f64>,
    #[serde(default)]
    pub cloudiness: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirQualityReading {
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub station_name: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub observed_at: Option<String>,
    #[serde(default)]
    pub air_quality_index: Option<u8>,
    #[serde(default)]
    pub air_quality_level: Option<String>,
    #[serde(default)]
    pub co: Option<f64>,
    #[serde(default)]
    pub no2: Option<f64>,
    #[serde(default)]
    pub o3: Option<f64>,
    #[serde(default)]
    pub so2: Option<f64>,
    #[serde(default, rename = "pm2_5")]
    pub pm2_5: Option<f64>,
    #[serde(default)]
    pub pm10: Option<f64>,
    #[serde(default)]
    pub nh3: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AirQualityReading {
    pub fn level(&self) -> Option<AqiLevel> {
        self.air_quality_index.and_then(AqiLevel::from_index)
    }
}

/// Global alert event: `{scope, data: {indexValue, ...}}`. The backend's
/// own payload uses `district` and `airQualityIndex`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    #[serde(alias = "district")]
    pub scope: String,
    #[serde(default)]
    pub data: Value,
}

impl AlertEvent {
    pub fn from_value(value: Value) -> Result<Self> {
        let event: AlertEvent =
            serde_json::from_value(unwrap_envelope(value)).map_err(|e| SyncError::malformed("alert", e))?;
        if event.scope.trim().is_empty() {
            return Err(SyncError::malformed("alert", "empty scope"));
        }
        Ok(event)
    }

    pub fn index_value(&self) -> Option<u8> {
        ["indexValue", "airQualityIndex"]
            .iter()
            .find_map(|key| self.data.get(*key).and_then(Value::as_u64))
            .and_then(|v| u8::try_from(v).ok())
    }

    pub fn level(&self) -> Option<AqiLevel> {
        self.index_value().and_then(AqiLevel::from_index)
    }
}
