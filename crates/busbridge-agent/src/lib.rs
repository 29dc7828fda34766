//! # busbridge agent
//!
//! The service side of the field-bus to MQTT bridge.
//!
//! ## Components
//!
//! - [`MappingStore`]: durable mapping table per bridge, backed by `SQLite`
//! - [`MqttBroker`]: one broker session shared by both bridges
//! - [`BridgeController`]: lifecycle, supervision and status of one bridge
//! - [`Agent`]: wires the Modbus-MQTT and CAN-MQTT bridges together
//!
//! Bus drivers are optional features, see [`drivers`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod drivers;
pub mod persistence;
pub mod publisher;
pub mod runtime;
pub mod store;

pub use config::AgentConfig;
pub use controller::{BridgeController, BridgeError, SourceBinding, StartReport};
pub use persistence::{BridgeSettings, SqliteStore};
pub use publisher::{BrokerClient, MqttBroker, PublishError, PublisherConfig};
pub use runtime::Agent;
pub use store::{MappingStore, StoreError};
