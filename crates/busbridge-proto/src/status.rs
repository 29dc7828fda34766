//! Aggregated bridge status as consumed by the dashboard.

use busbridge_core::{MappingRuntimeState, RawValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    /// Not running
    #[default]
    Stopped,
    /// Attaching to bus and broker
    Starting,
    /// Adapters running
    Running,
    /// Draining and shutting down
    Stopping,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Stopped => "stopped",
            BridgeState::Starting => "starting",
            BridgeState::Running => "running",
            BridgeState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Per-mapping statistics shown in the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingStatsView {
    /// Readings received
    pub messages_received: u64,
    /// Publishes acknowledged
    pub messages_published: u64,
    /// Publishes dropped
    pub messages_dropped: u64,
    /// Failed bus reads
    pub read_errors: u64,
    /// Time of the last reading
    pub last_seen: Option<DateTime<Utc>>,
    /// Time of the last publish
    pub last_publish: Option<DateTime<Utc>>,
    /// Last reading before transform
    pub last_raw_value: Option<RawValue>,
    /// Last published value
    pub last_published_value: Option<serde_json::Value>,
    /// Last failure
    pub last_error: Option<String>,
}

impl From<MappingRuntimeState> for MappingStatsView {
    fn from(state: MappingRuntimeState) -> Self {
        Self {
            messages_received: state.messages_received,
            messages_published: state.messages_published,
            messages_dropped: state.messages_dropped,
            read_errors: state.read_errors,
            last_seen: state.last_seen_at,
            last_publish: state.last_published_at,
            last_raw_value: state.last_raw_value,
            last_published_value: state.last_published_value,
            last_error: state.last_error,
        }
    }
}

/// Status of one bridge instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name (`modbus` or `can`)
    pub bridge: String,
    /// Lifecycle state
    pub state: BridgeState,
    /// Whether the bridge is running
    pub running: bool,
    /// Whether the shared broker session is connected
    #[serde(rename = "mqtt_connected")]
    pub broker_connected: bool,
    /// Whether the bus is up
    pub bus_connected: bool,
    /// CAN bridges only, mirrors `bus_connected`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_connected: Option<bool>,
    /// Stored mappings
    pub mappings_count: usize,
    /// Stored mappings with `enabled = true`
    pub enabled_mappings: usize,
    /// Polling interval in seconds (Modbus only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<f64>,
    /// Seconds since the bridge reached running
    pub uptime_seconds: u64,
    /// Publishes waiting for the broker
    pub queue_depth: usize,
    /// Per-mapping statistics of the current session
    pub statistics: BTreeMap<String, MappingStatsView>,
    /// Start warnings and soft configuration warnings
    pub warnings: Vec<String>,
}
