//! Bridge lifecycle and status.
//!
//! A [`BridgeController`] owns one bridge: its mapping store, the source
//! adapter of its bus and the session pipeline. The lifecycle is
//! `stopped -> starting -> running -> stopping -> stopped`, and a failed
//! start goes straight back to `stopped`.
//!
//! A running session consists of:
//! - the source adapter (Modbus poller or CAN dispatcher)
//! - a reload task applying store mutations to the pipeline and adapter
//! - a flusher task releasing deferred values when their interval elapses
//! - the publisher worker draining the pipeline queue into the broker

use busbridge_adapter_can::{CanDispatcher, CanListener, DispatcherConfig};
use busbridge_adapter_modbus::{ModbusLink, ModbusPoller, PollerConfig};
use busbridge_core::{Mapping, MappingId, MappingSet, Pipeline};
use busbridge_proto::{BridgeState, BridgeStatus, FrameEvent, MappingStatsView};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::persistence::BridgeSettings;
use crate::publisher::{run_publisher, BrokerClient, PublisherConfig};
use crate::store::{MappingStore, StoreError};

/// Capacity of the live CAN frame channel.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// The bus side of a bridge.
pub enum SourceBinding {
    /// Periodic register reads (Modbus)
    Polling {
        /// Serial device access
        link: Arc<dyn ModbusLink>,
        /// Poller settings; the poll interval is taken from the bridge settings
        config: PollerConfig,
    },
    /// Frame dispatch (CAN)
    Event {
        /// Received frames
        listener: Arc<dyn CanListener>,
        /// Dispatcher settings
        config: DispatcherConfig,
    },
}

/// Result of a successful [`BridgeController::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    /// The bridge was already running and nothing was done
    pub already_running: bool,
    /// Degraded conditions found while starting
    pub warnings: Vec<String>,
}

/// Bridge lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Nothing to bridge
    #[error("cannot start bridge: {0}")]
    StartPrecondition(String),
    /// MQTT publishing switched off in configuration
    #[error("MQTT publishing is disabled")]
    BrokerDisabled,
    /// Bus device could not be attached
    #[error("bus attach failed: {0}")]
    BusAttach(String),
    /// Poll interval rejected
    #[error("invalid poll interval: {0}")]
    InvalidPollInterval(String),
    /// Mapping store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Session {
    pipeline: Arc<Pipeline>,
    /// Stops the adapter and the helper tasks
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    /// Stops the publisher, which then drains
    publisher_cancel: CancellationToken,
    publisher: JoinHandle<()>,
    poller: Option<Arc<ModbusPoller>>,
}

/// What the status API reads while a session runs.
#[derive(Clone)]
struct ActiveView {
    pipeline: Arc<Pipeline>,
    started_at: Instant,
    warnings: Vec<String>,
}

/// One bridge instance (Modbus-MQTT or CAN-MQTT).
pub struct BridgeController {
    name: String,
    store: Arc<MappingStore>,
    broker: Arc<dyn BrokerClient>,
    source: SourceBinding,
    engine: EngineConfig,
    state: Mutex<BridgeState>,
    session: tokio::sync::Mutex<Option<Session>>,
    active: RwLock<Option<ActiveView>>,
    poll_interval: Mutex<f64>,
    frames: broadcast::Sender<FrameEvent>,
}

impl BridgeController {
    /// Create a stopped bridge.
    ///
    /// # Errors
    ///
    /// Returns error if the persisted bridge settings cannot be read.
    pub fn new(
        name: impl Into<String>,
        store: Arc<MappingStore>,
        broker: Arc<dyn BrokerClient>,
        source: SourceBinding,
        engine: EngineConfig,
    ) -> Result<Self, BridgeError> {
        let settings = store.settings()?;
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);

        Ok(Self {
            name: name.into(),
            store,
            broker,
            source,
            engine,
            state: Mutex::new(BridgeState::Stopped),
            session: tokio::sync::Mutex::new(None),
            active: RwLock::new(None),
            poll_interval: Mutex::new(settings.poll_interval),
            frames,
        })
    }

    /// Bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        *self.state.lock()
    }

    /// Start bridging. Starting a running bridge is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::StartPrecondition`] if no mapping is enabled,
    /// [`BridgeError::BrokerDisabled`] if publishing is switched off, and
    /// [`BridgeError::BusAttach`] if a Modbus device cannot be attached. The
    /// bridge stays stopped in every case.
    pub async fn start(&self) -> Result<StartReport, BridgeError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            tracing::debug!(bridge = %self.name, "Bridge already running");
            return Ok(StartReport {
                already_running: true,
                warnings: self.start_warnings(),
            });
        }

        let mut store_rx = self.store.subscribe();
        let mappings = store_rx.borrow_and_update().clone();

        if !mappings.iter().any(|m| m.enabled) {
            tracing::warn!(bridge = %self.name, "Refusing to start without enabled mappings");
            return Err(BridgeError::StartPrecondition(
                "no enabled mappings".to_string(),
            ));
        }
        if !self.broker.is_enabled() {
            tracing::warn!(bridge = %self.name, "Refusing to start, MQTT publishing is disabled");
            return Err(BridgeError::BrokerDisabled);
        }

        self.set_state(BridgeState::Starting);

        let pipeline = Arc::new(Pipeline::new(self.engine.queue_capacity));
        pipeline.activate(&mappings);

        let cancel = CancellationToken::new();
        let (adapter_tx, adapter_rx) = watch::channel(Arc::clone(&mappings));
        let mut warnings = Vec::new();
        let mut tasks = Vec::new();
        let mut poller = None;

        match &self.source {
            SourceBinding::Polling { link, config } => {
                let mut config = config.clone();
                config.poll_interval = self.poll_interval_duration();
                let modbus = Arc::new(ModbusPoller::new(
                    Arc::clone(link),
                    Arc::clone(&pipeline),
                    config,
                ));
                match modbus.attach_all(&mappings).await {
                    Ok(devices) => {
                        tracing::info!(bridge = %self.name, devices, "Modbus devices attached");
                    }
                    Err(e) => {
                        modbus.release_opened().await;
                        self.set_state(BridgeState::Stopped);
                        tracing::error!(bridge = %self.name, error = %e, "Bridge start failed");
                        return Err(BridgeError::BusAttach(e.to_string()));
                    }
                }
                tasks.push(modbus.spawn(adapter_rx, cancel.clone()));
                poller = Some(modbus);
            }
            SourceBinding::Event { listener, config } => {
                let dispatcher = Arc::new(CanDispatcher::new(
                    Arc::clone(listener),
                    Arc::clone(&pipeline),
                    config.clone(),
                    self.frames.clone(),
                ));
                warnings.extend(dispatcher.attach());
                tasks.push(dispatcher.spawn(adapter_rx, cancel.clone()));
            }
        }

        if !self.broker.is_connected() {
            tracing::warn!(
                bridge = %self.name,
                "MQTT broker not connected, readings are dropped until it is reachable"
            );
            warnings.push(
                "MQTT broker not connected; readings are dropped until it is reachable"
                    .to_string(),
            );
        }

        tasks.push(tokio::spawn(forward_reloads(
            store_rx,
            Arc::clone(&pipeline),
            adapter_tx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(flush_deferred(
            Arc::clone(&pipeline),
            cancel.clone(),
        )));

        let publisher_cancel = CancellationToken::new();
        let publisher = tokio::spawn(run_publisher(
            Arc::clone(&pipeline),
            Arc::clone(&self.broker),
            PublisherConfig {
                drain_deadline: self.engine.drain_deadline,
                publish_timeout: self.engine.publish_timeout,
            },
            publisher_cancel.clone(),
        ));

        *self.active.write() = Some(ActiveView {
            pipeline: Arc::clone(&pipeline),
            started_at: Instant::now(),
            warnings: warnings.clone(),
        });
        *session = Some(Session {
            pipeline,
            cancel,
            tasks,
            publisher_cancel,
            publisher,
            poller,
        });
        self.set_state(BridgeState::Running);
        self.persist_autostart(true);

        tracing::info!(
            bridge = %self.name,
            mappings = mappings.len(),
            warnings = warnings.len(),
            "Bridge running"
        );
        Ok(StartReport {
            already_running: false,
            warnings,
        })
    }

    /// Stop bridging and clear the autostart flag. Stopping a stopped bridge
    /// is a no-op.
    ///
    /// Adapters are stopped first, then queued publishes are drained within
    /// the drain deadline. Devices the bridge opened itself are released.
    pub async fn stop(&self) {
        self.teardown().await;
        self.persist_autostart(false);
    }

    /// Stop bridging for process shutdown, keeping the autostart flag.
    pub async fn shutdown(&self) {
        self.teardown().await;
    }

    async fn teardown(&self) {
        let mut session = self.session.lock().await;
        let Some(current) = session.take() else {
            return;
        };

        self.set_state(BridgeState::Stopping);

        current.cancel.cancel();
        for task in current.tasks {
            let _ = task.await;
        }

        current.publisher_cancel.cancel();
        let _ = current.publisher.await;
        let dropped = current.pipeline.shutdown();

        if let Some(poller) = &current.poller {
            poller.release_opened().await;
        }

        *self.active.write() = None;
        self.set_state(BridgeState::Stopped);
        tracing::info!(bridge = %self.name, dropped, "Bridge stopped");
    }

    /// Aggregated status with a copy of the per-mapping statistics.
    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        let mappings = self.store.snapshot();
        let state = self.state();
        let active = self.active.read().clone();

        let mut status = BridgeStatus {
            bridge: self.name.clone(),
            state,
            running: state == BridgeState::Running,
            broker_connected: self.broker.is_connected(),
            mappings_count: mappings.len(),
            enabled_mappings: mappings.iter().filter(|m| m.enabled).count(),
            ..BridgeStatus::default()
        };

        if let Some(active) = active {
            status.bus_connected = active.pipeline.bus_connected();
            status.uptime_seconds = active.started_at.elapsed().as_secs();
            status.queue_depth = active.pipeline.queue().len();
            status.statistics = active
                .pipeline
                .snapshot()
                .into_iter()
                .map(|(id, state)| (id, MappingStatsView::from(state)))
                .collect();
            status.warnings = active.warnings;
        }
        status.warnings.extend(self.store.duplicate_warnings());

        match self.source {
            SourceBinding::Polling { .. } => {
                status.poll_interval = Some(*self.poll_interval.lock());
            }
            SourceBinding::Event { .. } => status.can_connected = Some(status.bus_connected),
        }

        status
    }

    /// Statistics of one mapping in the current session.
    #[must_use]
    pub fn mapping_stats(&self, id: &str) -> Option<MappingStatsView> {
        self.active
            .read()
            .as_ref()
            .and_then(|active| active.pipeline.mapping_state(id))
            .map(MappingStatsView::from)
    }

    /// Zero the statistics of the current session without stopping it.
    pub fn reset_statistics(&self) {
        if let Some(active) = self.active.read().as_ref() {
            active.pipeline.reset_statistics();
            tracing::info!(bridge = %self.name, "Statistics reset");
        }
    }

    /// Change the Modbus poll interval. Takes effect at the next start.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidPollInterval`] for a CAN bridge or a
    /// value that is not a positive number of seconds, and a store error if
    /// the setting cannot be persisted.
    pub fn set_poll_interval(&self, seconds: f64) -> Result<(), BridgeError> {
        if matches!(self.source, SourceBinding::Event { .. }) {
            return Err(BridgeError::InvalidPollInterval(
                "only Modbus bridges are polled".to_string(),
            ));
        }
        if seconds <= 0.0 || Duration::try_from_secs_f64(seconds).is_err() {
            return Err(BridgeError::InvalidPollInterval(format!(
                "{seconds} is not a positive number of seconds"
            )));
        }

        let mut settings = self.store.settings()?;
        settings.poll_interval = seconds;
        self.store.save_settings(&settings)?;
        *self.poll_interval.lock() = seconds;

        tracing::info!(bridge = %self.name, poll_interval = seconds, "Poll interval changed");
        Ok(())
    }

    /// Whether the bridge should be started when the agent boots.
    ///
    /// # Errors
    ///
    /// Returns error if the settings cannot be read.
    pub fn autostart(&self) -> Result<bool, BridgeError> {
        Ok(self.store.settings()?.autostart)
    }

    /// One event per received CAN frame. Never yields for Modbus bridges.
    #[must_use]
    pub fn subscribe_frames(&self) -> broadcast::Receiver<FrameEvent> {
        self.frames.subscribe()
    }

    /// Validate and store a new mapping.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub fn create_mapping(&self, mapping: Mapping) -> Result<MappingId, BridgeError> {
        Ok(self.store.create(mapping)?)
    }

    /// Replace a stored mapping.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub fn update_mapping(&self, id: &str, mapping: Mapping) -> Result<(), BridgeError> {
        Ok(self.store.update(id, mapping)?)
    }

    /// Delete a stored mapping and, if running, its statistics.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub fn delete_mapping(&self, id: &str) -> Result<(), BridgeError> {
        Ok(self.store.delete(id)?)
    }

    /// All mappings in insertion order.
    #[must_use]
    pub fn list_mappings(&self) -> Vec<Mapping> {
        self.store.list()
    }

    /// One mapping.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] wrapped in [`BridgeError::Store`].
    pub fn get_mapping(&self, id: &str) -> Result<Mapping, BridgeError> {
        Ok(self.store.get(id)?)
    }

    fn start_warnings(&self) -> Vec<String> {
        self.active
            .read()
            .as_ref()
            .map(|active| active.warnings.clone())
            .unwrap_or_default()
    }

    fn set_state(&self, next: BridgeState) {
        let mut state = self.state.lock();
        let previous = *state;
        if previous != next {
            tracing::debug!(
                bridge = %self.name,
                from = %previous,
                to = %next,
                "Bridge state changed"
            );
            *state = next;
        }
    }

    fn poll_interval_duration(&self) -> Duration {
        Duration::try_from_secs_f64(*self.poll_interval.lock())
            .unwrap_or_else(|_| Duration::from_secs(1))
    }

    fn persist_autostart(&self, autostart: bool) {
        let result = self.store.settings().and_then(|settings| {
            if settings.autostart == autostart {
                return Ok(());
            }
            self.store.save_settings(&BridgeSettings {
                autostart,
                ..settings
            })
        });
        if let Err(e) = result {
            tracing::warn!(bridge = %self.name, error = %e, "Cannot persist autostart flag");
        }
    }
}

/// Apply store mutations to the pipeline, then hand them to the adapter.
async fn forward_reloads(
    mut store_rx: watch::Receiver<MappingSet>,
    pipeline: Arc<Pipeline>,
    adapter_tx: watch::Sender<MappingSet>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = store_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let mappings = store_rx.borrow_and_update().clone();
                pipeline.activate(&mappings);
                adapter_tx.send_replace(mappings);
                tracing::debug!(active = pipeline.active_count(), "Mapping set reloaded");
            }
        }
    }
}

/// Queue deferred values as soon as their interval has elapsed.
async fn flush_deferred(pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    loop {
        let notified = pipeline.flush_notified();
        let next = pipeline.next_flush_at();
        tokio::select! {
            () = cancel.cancelled() => break,
            () = notified => {}
            () = time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let flushed = pipeline.flush_due(Instant::now());
                if flushed > 0 {
                    tracing::debug!(flushed, "Deferred values queued");
                }
            }
        }
    }
}
