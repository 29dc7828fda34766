//! # busbridge core
//!
//! Bus-agnostic pieces of the field-bus to MQTT bridge engine.
//!
//! This crate provides:
//! - The mapping model binding one Modbus register or CAN id to one MQTT topic
//! - The transform step turning a raw bus reading into a publishable value
//! - The publish gate (change detection, rate limiting, debounce)
//! - Per-mapping runtime state and the bounded publish handoff queue
//! - The [`Pipeline`] that ties these together behind one synchronized API

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod frame;
pub mod gate;
pub mod mapping;
pub mod pipeline;
pub mod queue;
pub mod runtime;
pub mod topic;
pub mod transform;

pub use backoff::Backoff;
pub use frame::CanFrame;
pub use gate::{Decision, GatePolicy, GateState, Suppression};
pub use mapping::{
    find_duplicate_routes, generate_id, BusKind, FunctionCode, Mapping, MappingId, MappingSet, Qos,
    Scaling, Source, ValidationError,
};
pub use pipeline::{DropReason, IngestOutcome, Pipeline};
pub use queue::{Outgoing, PublishQueue, PushOutcome};
pub use runtime::{MappingRuntimeState, RawValue};
pub use transform::{FramePackaging, RegisterScaling, Transform, Value};
