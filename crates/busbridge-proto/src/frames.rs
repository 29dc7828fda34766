//! Live CAN frame events.

use busbridge_core::CanFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One received frame, as pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEvent {
    /// Receive time
    pub timestamp: DateTime<Utc>,
    /// Always `RX`; the bridge never transmits
    pub direction: String,
    /// Frame id
    pub can_id: u32,
    /// Data length code
    pub dlc: usize,
    /// Payload bytes
    pub data: Vec<u8>,
    /// Extended id flag
    pub extended: bool,
}

impl From<&CanFrame> for FrameEvent {
    fn from(frame: &CanFrame) -> Self {
        Self {
            timestamp: frame.timestamp,
            direction: "RX".to_string(),
            can_id: frame.id,
            dlc: frame.dlc(),
            data: frame.data.clone(),
            extended: frame.extended,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_from_frame() {
        let frame = CanFrame::new(0x123, false, vec![0xDE, 0xAD]);
        let event = FrameEvent::from(&frame);

        assert_eq!(event.direction, "RX");
        assert_eq!(event.can_id, 0x123);
        assert_eq!(event.dlc, 2);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["data"], serde_json::json!([222, 173]));
    }
}
