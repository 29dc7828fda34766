//! The serial device capability consumed by the poller.

use async_trait::async_trait;
use busbridge_core::FunctionCode;

/// How a device was attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// The link opened the device for this caller; the caller releases it
    Opened,
    /// The device was already open and is shared with other subsystems
    Shared,
}

/// Access to Modbus devices on a serial line.
///
/// Implementations must serialize transactions per serial port and must let
/// a started transaction finish or time out on its own.
#[async_trait]
pub trait ModbusLink: Send + Sync {
    /// Attach to a device, reusing an existing connection when there is one.
    ///
    /// # Errors
    ///
    /// Returns error if the device is unknown or cannot be opened.
    async fn attach(&self, device_id: &str) -> Result<Attachment, ModbusError>;

    /// Read one register.
    ///
    /// # Errors
    ///
    /// Returns error on timeout, CRC or exception response, or a lost device.
    async fn read_register(
        &self,
        device_id: &str,
        function: FunctionCode,
        register: u16,
    ) -> Result<u16, ModbusError>;

    /// Close a device previously reported as [`Attachment::Opened`].
    async fn release(&self, device_id: &str);
}

/// Modbus read and attach errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModbusError {
    /// No response within the device timeout
    #[error("modbus read timed out")]
    Timeout,
    /// CRC error or exception response
    #[error("modbus protocol error: {0}")]
    Protocol(String),
    /// Serial device gone
    #[error("device disconnected: {0}")]
    Disconnected(String),
    /// Device id not configured
    #[error("unknown modbus device '{0}'")]
    UnknownDevice(String),
}

impl ModbusError {
    /// Whether the error means the device itself is unreachable.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ModbusError::Disconnected(_))
    }
}
