//! Bus drivers behind the adapter capabilities.
//!
//! Real drivers are feature-gated:
//! - `modbus-rtu`: Modbus RTU over a serial port (`tokio-modbus`, `tokio-serial`)
//! - `socketcan`: Linux SocketCAN feeding a [`CanHub`]
//!
//! Without them the agent still runs; Modbus attach fails with a clear
//! error and the CAN interface stays down.

#[cfg(feature = "modbus-rtu")]
mod modbus_rtu;
#[cfg(feature = "socketcan")]
mod can_socket;

#[cfg(feature = "modbus-rtu")]
pub use modbus_rtu::RtuLink;
#[cfg(feature = "socketcan")]
pub use can_socket::spawn_reader;

use async_trait::async_trait;
use busbridge_adapter_can::CanHub;
use busbridge_adapter_modbus::{Attachment, ModbusError, ModbusLink};
use busbridge_core::FunctionCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{CanConfig, ModbusConfig};

/// Modbus link of a build without serial support.
#[derive(Debug, Default)]
pub struct UnavailableModbusLink;

const NO_RTU: &str = "Modbus RTU driver not available in this build";

#[async_trait]
impl ModbusLink for UnavailableModbusLink {
    async fn attach(&self, _device_id: &str) -> Result<Attachment, ModbusError> {
        Err(ModbusError::Disconnected(NO_RTU.to_string()))
    }

    async fn read_register(
        &self,
        _device_id: &str,
        _function: FunctionCode,
        _register: u16,
    ) -> Result<u16, ModbusError> {
        Err(ModbusError::Disconnected(NO_RTU.to_string()))
    }

    async fn release(&self, _device_id: &str) {}
}

/// The Modbus link for the configured serial devices.
#[must_use]
pub fn modbus_link(config: &ModbusConfig) -> Arc<dyn ModbusLink> {
    #[cfg(feature = "modbus-rtu")]
    {
        Arc::new(RtuLink::new(&config.devices))
    }
    #[cfg(not(feature = "modbus-rtu"))]
    {
        if !config.devices.is_empty() {
            tracing::warn!(devices = config.devices.len(), "{NO_RTU}, serial devices are ignored");
        }
        Arc::new(UnavailableModbusLink)
    }
}

/// The CAN hub, fed by the SocketCAN reader when built with it.
///
/// The reader runs until `cancel` fires.
#[must_use]
pub fn can_hub(config: &CanConfig, cancel: &CancellationToken) -> Arc<CanHub> {
    let hub = Arc::new(CanHub::default());
    #[cfg(feature = "socketcan")]
    {
        let _ = spawn_reader(config.interface.clone(), Arc::clone(&hub), cancel.clone());
    }
    #[cfg(not(feature = "socketcan"))]
    {
        let _ = cancel;
        tracing::warn!(
            interface = %config.interface,
            "SocketCAN driver not available in this build, CAN interface stays down"
        );
    }
    hub
}

#[cfg(test)]
mod tests {
    use super::*;
    use busbridge_adapter_can::CanListener;

    #[tokio::test]
    async fn unavailable_link_reports_disconnected() {
        let link = UnavailableModbusLink;
        let err = link.attach("dev1").await.unwrap_err();
        assert!(err.is_disconnect());
        assert!(link
            .read_register("dev1", FunctionCode::ReadHolding, 0)
            .await
            .is_err());
    }

    #[cfg(not(feature = "socketcan"))]
    #[tokio::test]
    async fn hub_without_driver_is_down() {
        let hub = can_hub(&crate::AgentConfig::default().can, &CancellationToken::new());
        assert!(!hub.is_up());
    }
}
