//! # busbridge wire formats
//!
//! Everything that leaves the engine in serialized form.
//!
//! ## Payloads
//!
//! - Modbus mappings publish the scaled value as a plain decimal string
//! - CAN mappings publish a JSON object with `can_id`, `data`, `dlc`,
//!   `timestamp`, `extended` and `mapping`
//!
//! ## Status
//!
//! [`BridgeStatus`] is the aggregated view polled by the dashboard, and
//! [`FrameEvent`] is pushed on the live CAN channel once per received frame.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frames;
pub mod payload;
pub mod status;

pub use frames::FrameEvent;
pub use payload::{encode_payload, CanPayload, PayloadError};
pub use status::{BridgeState, BridgeStatus, MappingStatsView};
