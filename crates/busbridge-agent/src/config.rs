//! Agent configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Shared broker session
    pub broker: BrokerConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Publish pipeline tuning
    pub engine: EngineConfig,

    /// Modbus RTU side
    pub modbus: ModbusConfig,

    /// CAN side
    pub can: CanConfig,
}

/// MQTT broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker URL (`tcp://`, `mqtt://` or `host:port`)
    pub url: String,

    /// Client id of the shared session
    pub client_id: String,

    /// Username, used only together with `password`
    pub username: Option<String>,

    /// Password
    pub password: Option<String>,

    /// Connect over TLS
    pub use_tls: bool,

    /// Keep-alive interval
    pub keep_alive: Duration,

    /// When false no bridge can be started
    pub enabled: bool,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Persistence type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for SQLite)
    pub db_path: PathBuf,
}

/// Publish pipeline configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the handoff queue between adapters and the publisher
    pub queue_capacity: usize,

    /// How long `stop()` keeps publishing queued values
    pub drain_deadline: Duration,

    /// Timeout for a single publish
    pub publish_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            drain_deadline: Duration::from_millis(2000),
            publish_timeout: Duration::from_millis(5000),
        }
    }
}

/// Modbus RTU configuration.
#[derive(Debug, Clone)]
pub struct ModbusConfig {
    /// Consecutive failed reads before a device counts as disconnected
    pub failure_threshold: u32,

    /// Serial devices mappings may refer to
    pub devices: Vec<ModbusDeviceConfig>,
}

/// One Modbus slave on a serial port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModbusDeviceConfig {
    /// Identifier referenced by `device_id` in mappings
    pub id: String,

    /// Serial port path
    pub port: String,

    /// Modbus slave address
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,

    /// Baud rate
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// Parity: "N", "E" or "O"
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1 or 2
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Per-transaction timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_slave_id() -> u8 {
    1
}

fn default_baudrate() -> u32 {
    9600
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

/// CAN configuration.
#[derive(Debug, Clone)]
pub struct CanConfig {
    /// SocketCAN interface name
    pub interface: String,

    /// No-traffic window after which the bus is reported disconnected
    pub silence_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig {
                url: "tcp://localhost:1883".to_string(),
                client_id: "busbridge".to_string(),
                username: None,
                password: None,
                use_tls: false,
                keep_alive: Duration::from_secs(60),
                enabled: true,
            },
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./busbridge.db"),
            },
            engine: EngineConfig::default(),
            modbus: ModbusConfig {
                failure_threshold: 3,
                devices: Vec::new(),
            },
            can: CanConfig {
                interface: "can0".to_string(),
                silence_timeout: Duration::from_millis(5000),
            },
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BUSBRIDGE_MQTT_BROKER`: MQTT broker URL
    /// - `BUSBRIDGE_MQTT_CLIENT_ID`: client id of the shared session
    /// - `BUSBRIDGE_MQTT_USERNAME` / `BUSBRIDGE_MQTT_PASSWORD`: credentials
    /// - `BUSBRIDGE_MQTT_TLS`: "true" to connect over TLS
    /// - `BUSBRIDGE_MQTT_KEEPALIVE_SECS`: keep-alive in seconds
    /// - `BUSBRIDGE_MQTT_ENABLED`: "false" disables publishing
    /// - `BUSBRIDGE_STORE`: "sqlite" or "memory"
    /// - `BUSBRIDGE_DB_PATH`: SQLite database path
    /// - `BUSBRIDGE_QUEUE_CAPACITY`: publish queue capacity
    /// - `BUSBRIDGE_DRAIN_DEADLINE_MS`: stop drain deadline
    /// - `BUSBRIDGE_PUBLISH_TIMEOUT_MS`: per-publish timeout
    /// - `BUSBRIDGE_MODBUS_FAILURE_THRESHOLD`: failed reads before disconnect
    /// - `BUSBRIDGE_MODBUS_DEVICES`: JSON list of serial devices
    /// - `BUSBRIDGE_CAN_INTERFACE`: SocketCAN interface
    /// - `BUSBRIDGE_CAN_SILENCE_MS`: CAN silence window
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("BUSBRIDGE_MQTT_BROKER") {
            config.broker.url = url;
        }

        if let Ok(client_id) = std::env::var("BUSBRIDGE_MQTT_CLIENT_ID") {
            config.broker.client_id = client_id;
        }

        config.broker.username = std::env::var("BUSBRIDGE_MQTT_USERNAME").ok();
        config.broker.password = std::env::var("BUSBRIDGE_MQTT_PASSWORD").ok();

        if let Ok(tls) = std::env::var("BUSBRIDGE_MQTT_TLS") {
            config.broker.use_tls = parse_bool(&tls).context("Invalid BUSBRIDGE_MQTT_TLS")?;
        }

        if let Ok(secs) = std::env::var("BUSBRIDGE_MQTT_KEEPALIVE_SECS") {
            config.broker.keep_alive = Duration::from_secs(
                secs.parse()
                    .context("Invalid BUSBRIDGE_MQTT_KEEPALIVE_SECS")?,
            );
        }

        if let Ok(enabled) = std::env::var("BUSBRIDGE_MQTT_ENABLED") {
            config.broker.enabled =
                parse_bool(&enabled).context("Invalid BUSBRIDGE_MQTT_ENABLED")?;
        }

        if let Ok(store_type) = std::env::var("BUSBRIDGE_STORE") {
            config.persistence.store_type = store_type;
        }

        if let Ok(db_path) = std::env::var("BUSBRIDGE_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Ok(capacity) = std::env::var("BUSBRIDGE_QUEUE_CAPACITY") {
            config.engine.queue_capacity = capacity
                .parse()
                .context("Invalid BUSBRIDGE_QUEUE_CAPACITY")?;
        }

        if let Ok(ms) = std::env::var("BUSBRIDGE_DRAIN_DEADLINE_MS") {
            config.engine.drain_deadline =
                Duration::from_millis(ms.parse().context("Invalid BUSBRIDGE_DRAIN_DEADLINE_MS")?);
        }

        if let Ok(ms) = std::env::var("BUSBRIDGE_PUBLISH_TIMEOUT_MS") {
            config.engine.publish_timeout = Duration::from_millis(
                ms.parse()
                    .context("Invalid BUSBRIDGE_PUBLISH_TIMEOUT_MS")?,
            );
        }

        if let Ok(threshold) = std::env::var("BUSBRIDGE_MODBUS_FAILURE_THRESHOLD") {
            config.modbus.failure_threshold = threshold
                .parse()
                .context("Invalid BUSBRIDGE_MODBUS_FAILURE_THRESHOLD")?;
        }

        // Parse serial devices from JSON env var
        if let Ok(devices_json) = std::env::var("BUSBRIDGE_MODBUS_DEVICES") {
            config.modbus.devices = serde_json::from_str(&devices_json)
                .context("Invalid BUSBRIDGE_MODBUS_DEVICES JSON")?;
        }

        if let Ok(interface) = std::env::var("BUSBRIDGE_CAN_INTERFACE") {
            config.can.interface = interface;
        }

        if let Ok(ms) = std::env::var("BUSBRIDGE_CAN_SILENCE_MS") {
            config.can.silence_timeout =
                Duration::from_millis(ms.parse().context("Invalid BUSBRIDGE_CAN_SILENCE_MS")?);
        }

        Ok(config)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{other}'"),
    }
}
