//! Modbus RTU over serial ports.

use async_trait::async_trait;
use busbridge_adapter_modbus::{Attachment, ModbusError, ModbusLink};
use busbridge_core::FunctionCode;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_modbus::client::{self, rtu};
use tokio_modbus::prelude::*;
use tokio_serial::SerialPortBuilderExt;

use crate::config::ModbusDeviceConfig;

/// One serial port. The mutex serializes transactions on the half-duplex line.
#[derive(Default)]
struct Port {
    ctx: Mutex<Option<client::Context>>,
}

/// [`ModbusLink`] over RTU serial ports, one client context per port.
pub struct RtuLink {
    devices: HashMap<String, ModbusDeviceConfig>,
    ports: HashMap<String, Port>,
}

impl RtuLink {
    /// Create a link for the configured devices. Ports are opened on attach.
    #[must_use]
    pub fn new(devices: &[ModbusDeviceConfig]) -> Self {
        let mut ports = HashMap::new();
        for device in devices {
            ports
                .entry(device.port.clone())
                .or_insert_with(Port::default);
        }
        Self {
            devices: devices
                .iter()
                .map(|d| (d.id.clone(), d.clone()))
                .collect(),
            ports,
        }
    }

    fn lookup(&self, device_id: &str) -> Result<(&ModbusDeviceConfig, &Port), ModbusError> {
        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| ModbusError::UnknownDevice(device_id.to_string()))?;
        let port = self
            .ports
            .get(&device.port)
            .ok_or_else(|| ModbusError::UnknownDevice(device_id.to_string()))?;
        Ok((device, port))
    }
}

fn open(device: &ModbusDeviceConfig) -> Result<client::Context, ModbusError> {
    let parity = match device.parity.as_str() {
        "E" | "e" => tokio_serial::Parity::Even,
        "O" | "o" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    };
    let stop_bits = if device.stop_bits == 2 {
        tokio_serial::StopBits::Two
    } else {
        tokio_serial::StopBits::One
    };

    let serial = tokio_serial::new(&device.port, device.baudrate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(parity)
        .stop_bits(stop_bits)
        .timeout(Duration::from_millis(device.timeout_ms))
        .open_native_async()
        .map_err(|e| ModbusError::Disconnected(format!("{}: {e}", device.port)))?;

    Ok(rtu::attach_slave(serial, Slave(device.slave_id)))
}

#[async_trait]
impl ModbusLink for RtuLink {
    async fn attach(&self, device_id: &str) -> Result<Attachment, ModbusError> {
        let (device, port) = self.lookup(device_id)?;
        let mut ctx = port.ctx.lock().await;
        if ctx.is_some() {
            return Ok(Attachment::Shared);
        }

        *ctx = Some(open(device)?);
        tracing::info!(
            device_id,
            port = %device.port,
            baudrate = device.baudrate,
            slave_id = device.slave_id,
            "Serial port opened"
        );
        Ok(Attachment::Opened)
    }

    async fn read_register(
        &self,
        device_id: &str,
        function: FunctionCode,
        register: u16,
    ) -> Result<u16, ModbusError> {
        let (device, port) = self.lookup(device_id)?;
        let mut guard = port.ctx.lock().await;
        let Some(ctx) = guard.as_mut() else {
            return Err(ModbusError::Disconnected(format!("{} not open", device.port)));
        };

        ctx.set_slave(Slave(device.slave_id));
        let request = async {
            match function {
                FunctionCode::ReadHolding => ctx.read_holding_registers(register, 1).await,
                FunctionCode::ReadInput => ctx.read_input_registers(register, 1).await,
            }
        };

        // outer error: transport or framing, inner error: exception response
        let result = tokio::time::timeout(Duration::from_millis(device.timeout_ms), request).await;
        match result {
            Err(_) => Err(ModbusError::Timeout),
            Ok(Ok(Ok(data))) => data
                .first()
                .copied()
                .ok_or_else(|| ModbusError::Protocol("empty response".to_string())),
            Ok(Ok(Err(exception))) => Err(ModbusError::Protocol(format!("exception: {exception}"))),
            Ok(Err(tokio_modbus::Error::Transport(e))) if e.kind() != ErrorKind::InvalidData => {
                // port is gone; the next attach reopens it
                *guard = None;
                Err(ModbusError::Disconnected(format!("{}: {e}", device.port)))
            }
            Ok(Err(e)) => Err(ModbusError::Protocol(e.to_string())),
        }
    }

    async fn release(&self, device_id: &str) {
        let Ok((device, port)) = self.lookup(device_id) else {
            return;
        };
        if let Some(mut ctx) = port.ctx.lock().await.take() {
            let _ = ctx.disconnect().await;
            tracing::info!(device_id, port = %device.port, "Serial port closed");
        }
    }
}
