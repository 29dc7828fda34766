//! CAN bus listener capability and the in-process frame hub.

use busbridge_core::CanFrame;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Source of received CAN frames.
pub trait CanListener: Send + Sync {
    /// Open a new subscription to received frames.
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;

    /// Whether the underlying interface is open.
    fn is_up(&self) -> bool;
}

/// Fan-out of received frames to any number of subscribers.
///
/// A bus driver publishes into the hub; the bridge and other subsystems
/// subscribe. A slow subscriber loses the oldest frames instead of
/// blocking the driver.
#[derive(Debug)]
pub struct CanHub {
    tx: broadcast::Sender<CanFrame>,
    up: AtomicBool,
}

impl CanHub {
    /// Create a hub buffering up to `capacity` frames per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            up: AtomicBool::new(false),
        }
    }

    /// Hand a received frame to all subscribers.
    ///
    /// Returns the number of subscribers that got it.
    pub fn publish(&self, frame: CanFrame) -> usize {
        self.tx.send(frame).unwrap_or(0)
    }

    /// Record whether the interface is open.
    pub fn set_up(&self, up: bool) {
        let was = self.up.swap(up, Ordering::SeqCst);
        if was != up {
            tracing::info!(up, "CAN interface state changed");
        }
    }
}

impl Default for CanHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl CanListener for CanHub {
    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.tx.subscribe()
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}
