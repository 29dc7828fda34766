//! Per-device polling loop.
//!
//! Each device walks `CONNECTING -> CONNECTED -> (read cycle)* -> DISCONNECTED`
//! and back to `CONNECTING` after a backoff delay. The supervisor watches the
//! active mapping set and starts, updates or retires device tasks so that an
//! edit takes effect at the next tick.

use busbridge_core::{
    Backoff, FunctionCode, Mapping, MappingSet, Pipeline, RawValue, RegisterScaling, Source,
    Transform,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::link::{Attachment, ModbusError, ModbusLink};

/// Configuration for the Modbus poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between read cycles
    pub poll_interval: Duration,
    /// Consecutive failed reads before a device counts as disconnected
    pub failure_threshold: u32,
    /// First reconnect delay
    pub reconnect_initial: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            failure_threshold: 3,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Connecting,
    Connected { failures: u32 },
    Disconnected,
}

struct DeviceTask {
    mappings: watch::Sender<Vec<Mapping>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polls Modbus registers and feeds the readings into a [`Pipeline`].
pub struct ModbusPoller {
    link: Arc<dyn ModbusLink>,
    pipeline: Arc<Pipeline>,
    config: PollerConfig,
    /// Devices this poller opened itself and must release
    opened: Mutex<HashSet<String>>,
}

impl ModbusPoller {
    /// Create a poller.
    #[must_use]
    pub fn new(link: Arc<dyn ModbusLink>, pipeline: Arc<Pipeline>, config: PollerConfig) -> Self {
        Self {
            link,
            pipeline,
            config,
            opened: Mutex::new(HashSet::new()),
        }
    }

    /// Attach every device referenced by an enabled mapping.
    ///
    /// Returns the number of attached devices.
    ///
    /// # Errors
    ///
    /// Returns the first attach failure. Devices attached before the failure
    /// stay attached until [`ModbusPoller::release_opened`].
    pub async fn attach_all(&self, mappings: &[Mapping]) -> Result<usize, ModbusError> {
        let devices = group_by_device(mappings);
        for device_id in devices.keys() {
            if let Err(e) = self.attach(device_id).await {
                tracing::warn!(device_id = %device_id, error = %e, "Modbus device attach failed");
                return Err(e);
            }
        }
        Ok(devices.len())
    }

    /// Start polling. The task ends when `cancel` fires.
    pub fn spawn(
        self: &Arc<Self>,
        mappings: watch::Receiver<MappingSet>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move { poller.supervise(mappings, cancel).await })
    }

    /// Release every device this poller opened itself.
    pub async fn release_opened(&self) {
        let devices: Vec<String> = self.opened.lock().drain().collect();
        for device_id in devices {
            self.link.release(&device_id).await;
            tracing::info!(device_id = %device_id, "Released Modbus device");
        }
    }

    async fn attach(&self, device_id: &str) -> Result<(), ModbusError> {
        let attachment = self.link.attach(device_id).await?;
        if attachment == Attachment::Opened {
            self.opened.lock().insert(device_id.to_string());
        }
        self.pipeline.set_bus_connected(device_id, true);
        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        mut mappings: watch::Receiver<MappingSet>,
        cancel: CancellationToken,
    ) {
        let mut devices: HashMap<String, DeviceTask> = HashMap::new();
        let mut retired = Vec::new();

        loop {
            let grouped = group_by_device(&mappings.borrow_and_update());

            let gone: Vec<String> = devices
                .keys()
                .filter(|device_id| !grouped.contains_key(*device_id))
                .cloned()
                .collect();
            for device_id in gone {
                if let Some(task) = devices.remove(&device_id) {
                    tracing::info!(
                        device_id = %device_id,
                        "Device has no enabled mappings, stopping its poll loop"
                    );
                    task.cancel.cancel();
                    retired.push(task.handle);
                }
            }

            for (device_id, device_mappings) in grouped {
                if let Some(task) = devices.get(&device_id) {
                    task.mappings.send_replace(device_mappings);
                    continue;
                }
                let (tx, rx) = watch::channel(device_mappings);
                let token = cancel.child_token();
                let handle = tokio::spawn(Arc::clone(&self).run_device(
                    device_id.clone(),
                    rx,
                    token.clone(),
                ));
                devices.insert(
                    device_id,
                    DeviceTask {
                        mappings: tx,
                        cancel: token,
                        handle,
                    },
                );
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                changed = mappings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        for task in devices.into_values() {
            task.cancel.cancel();
            retired.push(task.handle);
        }
        for handle in retired {
            let _ = handle.await;
        }
        tracing::debug!("Modbus poller stopped");
    }

    async fn run_device(
        self: Arc<Self>,
        device_id: String,
        mappings: watch::Receiver<Vec<Mapping>>,
        cancel: CancellationToken,
    ) {
        let mut state = DeviceState::Connecting;
        let mut backoff = Backoff::new(self.config.reconnect_initial, self.config.reconnect_max);
        let mut ticker = time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !cancel.is_cancelled() {
            state = match state {
                DeviceState::Connecting => match self.attach(&device_id).await {
                    Ok(()) => {
                        tracing::info!(device_id = %device_id, "Modbus device connected");
                        backoff.reset();
                        ticker.reset_immediately();
                        DeviceState::Connected { failures: 0 }
                    }
                    Err(e) => {
                        tracing::warn!(
                            device_id = %device_id,
                            error = %e,
                            "Modbus device attach failed"
                        );
                        self.pipeline.set_bus_connected(&device_id, false);
                        DeviceState::Disconnected
                    }
                },
                DeviceState::Connected { failures } => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let current = mappings.borrow().clone();
                    let failures = self.read_cycle(&device_id, &current, failures, &cancel).await;
                    if failures >= self.config.failure_threshold {
                        tracing::warn!(
                            device_id = %device_id,
                            failures,
                            "Modbus device disconnected"
                        );
                        self.pipeline.set_bus_connected(&device_id, false);
                        DeviceState::Disconnected
                    } else {
                        DeviceState::Connected { failures }
                    }
                }
                DeviceState::Disconnected => {
                    let delay = backoff.next_delay();
                    tracing::debug!(
                        device_id = %device_id,
                        delay_ms = delay.as_millis(),
                        "Reconnecting after backoff"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = time::sleep(delay) => {}
                    }
                    DeviceState::Connecting
                }
            };
        }

        self.pipeline.clear_bus(&device_id);
        tracing::debug!(device_id = %device_id, "Device poll loop stopped");
    }

    /// Read every enabled mapping of one device once.
    ///
    /// Returns the updated count of consecutive failures.
    async fn read_cycle(
        &self,
        device_id: &str,
        mappings: &[Mapping],
        mut failures: u32,
        cancel: &CancellationToken,
    ) -> u32 {
        for mapping in mappings.iter().filter(|m| m.enabled) {
            if cancel.is_cancelled() {
                break;
            }
            let Some((function, register)) = register_address(mapping) else {
                continue;
            };

            match self.link.read_register(device_id, function, register).await {
                Ok(raw) => {
                    failures = 0;
                    let value = RegisterScaling(mapping.effective_scaling()).apply(raw);
                    self.pipeline.ingest(&mapping.id, RawValue::Register(raw), value);
                }
                Err(e) => {
                    tracing::debug!(
                        device_id = %device_id,
                        mapping_id = %mapping.id,
                        register,
                        error = %e,
                        "Register read failed"
                    );
                    self.pipeline.record_read_error(&mapping.id, &e.to_string());
                    failures += 1;
                    if e.is_disconnect() {
                        return failures.max(self.config.failure_threshold);
                    }
                }
            }
        }
        failures
    }
}

fn register_address(mapping: &Mapping) -> Option<(FunctionCode, u16)> {
    match &mapping.source {
        Source::Modbus {
            register,
            function_code,
            ..
        } => Some((
            FunctionCode::try_from(*function_code).ok()?,
            u16::try_from(*register).ok()?,
        )),
        Source::Can { .. } => None,
    }
}

/// Enabled Modbus mappings grouped by device, in list order.
fn group_by_device(mappings: &[Mapping]) -> BTreeMap<String, Vec<Mapping>> {
    let mut grouped: BTreeMap<String, Vec<Mapping>> = BTreeMap::new();
    for mapping in mappings.iter().filter(|m| m.enabled) {
        if let Some(device_id) = mapping.source.device_id() {
            grouped
                .entry(device_id.to_string())
                .or_default()
                .push(mapping.clone());
        }
    }
    grouped
}
