pub mod influx;
pub mod mqtt;
pub mod query;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use influx::{InfluxReader, ReaderError};
pub use mqtt::{MqttPublisher, PublishError};

/// Latest speed-test sample. Bandwidths are in Mbps, latency in ms.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub download_bandwidth: f64,
    pub upload_bandwidth: f64,
    pub ping_latency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

/// Flat key/value message bound for the message bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OutboundMessage {
    fields: BTreeMap<String, FieldValue>,
}

impl OutboundMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Sends outbound messages to the message bus.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), PublishError>;
}

/// Reads the most recent telemetry record from the store.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn latest(&self) -> Result<Option<TelemetryRecord>, ReaderError>;
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Convert a raw bandwidth sample to Mbps.
pub fn to_mbps(raw: f64) -> f64 {
    round2(raw * 8.0 / 10000.0 / 100.0)
}
