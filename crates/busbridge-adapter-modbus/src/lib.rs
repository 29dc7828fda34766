//! # Modbus polling adapter
//!
//! Periodic register reads for Modbus RTU mappings.
//!
//! ## Devices
//!
//! Every serial device gets its own task. Registers on one device are read
//! one after another because the RS-485 line is half-duplex with a single
//! master. Devices are reached through the [`ModbusLink`] capability, which
//! is shared with other subsystems of the controller.
//!
//! ## Failures
//!
//! A failed read is counted against its mapping and retried on the next
//! tick. After a number of consecutive failures the device is reported
//! disconnected and re-attached with exponential backoff.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod link;
pub mod poller;

pub use link::{Attachment, ModbusError, ModbusLink};
pub use poller::{ModbusPoller, PollerConfig};
