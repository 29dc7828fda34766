//! # CAN event adapter
//!
//! Dispatches received CAN frames to the mappings that listen for them.
//!
//! ## Listener
//!
//! Frames arrive through the [`CanListener`] capability. [`CanHub`] is the
//! in-process fan-out used by the bus driver and by other subsystems that
//! want to see the same traffic.
//!
//! ## Connectivity
//!
//! CAN has no connect handshake. The bus counts as connected while frames
//! keep arriving and as disconnected after a quiet period; the subscription
//! stays open either way.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatcher;
pub mod listener;

pub use dispatcher::{CanDispatcher, DispatcherConfig, CAN_SCOPE};
pub use listener::{CanHub, CanListener};
