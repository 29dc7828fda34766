//! Agent runtime orchestration.

use anyhow::{Context, Result};
use busbridge_adapter_can::{CanListener, DispatcherConfig};
use busbridge_adapter_modbus::PollerConfig;
use busbridge_core::BusKind;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::controller::{BridgeController, SourceBinding};
use crate::drivers;
use crate::persistence::SqliteStore;
use crate::publisher::{BrokerClient, DisabledBroker, MqttBroker};
use crate::store::MappingStore;

/// The agent: one shared broker session and both bridges.
pub struct Agent {
    modbus: Arc<BridgeController>,
    can: Arc<BridgeController>,
    /// Stops the broker event loop and the bus drivers
    cancel: CancellationToken,
}

impl Agent {
    /// Open the store, connect the broker and build both bridges, stopped.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened or the broker URL is invalid.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let db = match config.persistence.store_type.as_str() {
            "sqlite" => SqliteStore::open(&config.persistence.db_path)
                .context("Failed to open SQLite database")?,
            "memory" => SqliteStore::in_memory().context("Failed to create in-memory database")?,
            other => anyhow::bail!("Unknown store type '{other}', expected sqlite or memory"),
        };
        let db = Arc::new(db);

        let cancel = CancellationToken::new();

        let broker: Arc<dyn BrokerClient> = if config.broker.enabled {
            MqttBroker::start(&config.broker, cancel.clone())
                .context("Failed to create MQTT client")?
        } else {
            tracing::warn!("MQTT publishing disabled, bridges cannot be started");
            Arc::new(DisabledBroker)
        };

        let modbus_store = Arc::new(
            MappingStore::open(BusKind::Modbus, Arc::clone(&db))
                .context("Failed to load Modbus mappings")?,
        );
        let modbus = BridgeController::new(
            "modbus",
            modbus_store,
            Arc::clone(&broker),
            SourceBinding::Polling {
                link: drivers::modbus_link(&config.modbus),
                config: PollerConfig {
                    failure_threshold: config.modbus.failure_threshold,
                    ..PollerConfig::default()
                },
            },
            config.engine.clone(),
        )?;

        let can_store = Arc::new(
            MappingStore::open(BusKind::Can, db).context("Failed to load CAN mappings")?,
        );
        let hub = drivers::can_hub(&config.can, &cancel);
        let can = BridgeController::new(
            "can",
            can_store,
            broker,
            SourceBinding::Event {
                listener: hub as Arc<dyn CanListener>,
                config: DispatcherConfig {
                    silence_timeout: config.can.silence_timeout,
                    ..DispatcherConfig::default()
                },
            },
            config.engine.clone(),
        )?;

        Ok(Self {
            modbus: Arc::new(modbus),
            can: Arc::new(can),
            cancel,
        })
    }

    /// The Modbus-MQTT bridge.
    #[must_use]
    pub fn modbus(&self) -> &Arc<BridgeController> {
        &self.modbus
    }

    /// The CAN-MQTT bridge.
    #[must_use]
    pub fn can(&self) -> &Arc<BridgeController> {
        &self.can
    }

    /// Start every bridge that was running when it was last stopped.
    ///
    /// A bridge that fails to start is logged and left stopped.
    pub async fn autostart(&self) {
        for bridge in [&self.modbus, &self.can] {
            match bridge.autostart() {
                Ok(true) => match bridge.start().await {
                    Ok(report) => {
                        for warning in &report.warnings {
                            tracing::warn!(
                                bridge = bridge.name(),
                                warning = %warning,
                                "Bridge started degraded"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::error!(bridge = bridge.name(), error = %e, "Autostart failed");
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        bridge = bridge.name(),
                        error = %e,
                        "Cannot read bridge settings"
                    );
                }
            }
        }
    }

    /// Run until Ctrl+C, then stop both bridges.
    ///
    /// # Errors
    ///
    /// Returns error if the signal handler cannot be installed.
    pub async fn run(self) -> Result<()> {
        self.autostart().await;

        tracing::info!("Agent running, press Ctrl+C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;

        tracing::info!("Shutting down");
        self.shutdown().await;
        Ok(())
    }

    /// Stop both bridges, keeping their autostart flags, then the drivers.
    pub async fn shutdown(&self) {
        self.modbus.shutdown().await;
        self.can.shutdown().await;
        self.cancel.cancel();
    }
}
