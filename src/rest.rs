//! Request/response collaborators
//!
//! One-shot REST calls against the telemetry backend and a free-text
//! geocoding service. Nothing here touches subscription state.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::models::Entity;
use crate::topics::Topics;

/// Thin client for the backend's REST endpoints.
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    topics: Topics,
}

impl BackendClient {
    pub fn new(client: Client, topics: Topics) -> Self {
        Self { client, topics }
    }

    /// The full registry as a one-shot list. Records without an id are skipped.
    pub async fn fetch_platforms(&self) -> Result<Vec<Entity>> {
        let records = self.get_records(&self.topics.platforms_rest()).await?;
        let mut entities = Vec::with_capacity(records.len());
        for record in records {
            match Entity::from_value(record) {
                Ok(entity) => entities.push(entity),
                Err(e) => warn!("Skipping registry record: {}", e),
            }
        }
        debug!("Fetched {} platform(s)", entities.len());
        Ok(entities)
    }

    /// Device/sensor metadata attached to one registry entity.
    pub async fn fetch_devices(&self, platform_id: &str) -> Result<Vec<Value>> {
        self.get_records(&self.topics.platform_devices_rest(platform_id)).await
    }

    async fn get_records(&self, url: &str) -> Result<Vec<Value>> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::connection(url, e))?;
        if !response.status().is_success() {
            return Err(SyncError::connection(url, format!("HTTP {}", response.status())));
        }
        let body: Value = response.json().await?;
        unwrap_response(body)
    }
}

/// Accept a bare JSON array or the backend's `{EC, EM, DT}` response wrapper.
pub fn unwrap_response(body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) if map.contains_key("EC") || map.contains_key("DT") => {
            let code = map.get("EC").and_then(Value::as_i64).unwrap_or(0);
            if code != 0 {
                let message = map.get("EM").and_then(Value::as_str).unwrap_or("unknown error").to_string();
                return Err(SyncError::Backend { code, message });
            }
            match map.remove("DT") {
                Some(Value::Array(items)) => Ok(items),
                Some(Value::Null) | None => Ok(Vec::new()),
                Some(other) => Ok(vec![other]),
            }
        }
        other => Err(SyncError::MalformedEntity(format!("expected a list, got {}", type_name(&other)))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One geocoding candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub display_name: String,
    #[serde(deserialize_with = "number_or_string")]
    pub lat: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub lon: f64,
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Free-text place search.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Suggestion>>;
}

/// Nominatim-compatible geocoder.
pub struct NominatimGeocoder {
    client: Client,
    endpoint: String,
    context: Option<String>,
}

impl NominatimGeocoder {
    pub fn new(endpoint: impl Into<String>, user_agent: &str) -> Self {
        Self {
            client: Client::builder().user_agent(user_agent).build().unwrap_or_default(),
            endpoint: endpoint.into(),
            context: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut geocoder = Self::new(config.geocoder_url.clone(), &config.user_agent);
        geocoder.context = config.geocoder_context.clone();
        geocoder
    }

    /// Suffix appended to every query to bias results toward one area.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn query_url(&self, query: &str, limit: usize) -> String {
        let text = match &self.context {
            Some(context) => format!("{}{}", query.trim(), context),
            None => query.trim().to_string(),
        };
        format!(
            "{}?format=json&q={}&limit={}&addressdetails=1",
            self.endpoint,
            urlencoding::encode(&text),
            limit
        )
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Suggestion>> {
        let url = self.query_url(query, limit);
        debug!("Geocoding: {}", query);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::Geocoding(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::Geocoding(format!("HTTP {}", response.status())));
        }
        let raw: Vec<Value> = response.json().await.map_err(|e| SyncError::Geocoding(e.to_string()))?;

        Ok(raw
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<Suggestion>(item) {
                Ok(s) => Some(s),
                Err(e) => {
                    debug!("Skipping geocoding result: {}", e);
                    None
                }
            })
            .take(limit)
            .collect())
    }
}
