//! Session-scoped runtime state of active mappings.

use crate::transform::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw reading before transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    /// Modbus register content
    Register(u16),
    /// CAN payload, upper-case hex
    Frame(String),
}

/// Counters and last-seen values of one active mapping.
///
/// Created when a mapping becomes active and discarded when it is deleted or
/// the bridge stops. Nothing here is persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingRuntimeState {
    /// Last reading before transform
    pub last_raw_value: Option<RawValue>,
    /// Last value acknowledged by the broker
    pub last_published_value: Option<serde_json::Value>,
    /// Time of the last reading
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Time of the last acknowledged publish
    pub last_published_at: Option<DateTime<Utc>>,
    /// Readings received
    pub messages_received: u64,
    /// Publishes acknowledged by the broker
    pub messages_published: u64,
    /// Publishes dropped (broker down, queue overflow, shutdown)
    pub messages_dropped: u64,
    /// Failed bus reads
    pub read_errors: u64,
    /// Last read or publish failure
    pub last_error: Option<String>,
}

impl MappingRuntimeState {
    /// Record a reading.
    pub fn record_received(&mut self, raw: RawValue, at: DateTime<Utc>) {
        self.last_raw_value = Some(raw);
        self.last_seen_at = Some(at);
        self.messages_received += 1;
    }

    /// Record a successful publish.
    pub fn record_published(&mut self, value: &Value, at: DateTime<Utc>) {
        self.last_published_value = Some(published_json(value));
        self.last_published_at = Some(at);
        self.messages_published += 1;
    }

    /// Record a dropped publish.
    pub fn record_dropped(&mut self, reason: impl Into<String>) {
        self.messages_dropped += 1;
        self.last_error = Some(reason.into());
    }

    /// Record a failed bus read.
    pub fn record_read_error(&mut self, error: impl Into<String>) {
        self.read_errors += 1;
        self.last_error = Some(error.into());
    }

    /// Zero counters and timestamps, keeping the last values.
    pub fn reset_counters(&mut self) {
        self.messages_received = 0;
        self.messages_published = 0;
        self.messages_dropped = 0;
        self.read_errors = 0;
        self.last_seen_at = None;
        self.last_published_at = None;
        self.last_error = None;
    }
}

fn published_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Scalar(v) => serde_json::Number::from_f64(*v)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Frame(frame) => serde_json::Value::String(frame.data_hex()),
    }
}
