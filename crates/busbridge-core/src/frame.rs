//! CAN frames as seen by the bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A received CAN frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Frame identifier (11 or 29 bit)
    pub id: u32,
    /// Whether `id` is a 29-bit extended identifier
    pub extended: bool,
    /// Payload bytes (up to 8 for classic CAN, 64 for CAN FD)
    pub data: Vec<u8>,
    /// Receive time
    pub timestamp: DateTime<Utc>,
}

impl CanFrame {
    /// Create a frame stamped with the current time.
    #[must_use]
    pub fn new(id: u32, extended: bool, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            extended,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    /// Data length code.
    #[must_use]
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Payload as an upper-case hex string without separators.
    #[must_use]
    pub fn data_hex(&self) -> String {
        hex::encode_upper(&self.data)
    }

    /// Identifier rendered as `0x%03X` (standard) or `0x%08X` (extended).
    #[must_use]
    pub fn id_hex(&self) -> String {
        if self.extended {
            format!("0x{:08X}", self.id)
        } else {
            format!("0x{:03X}", self.id)
        }
    }

    /// Whether two frames carry the same identifier and payload.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id && self.extended == other.extended && self.data == other.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_rendering() {
        let frame = CanFrame::new(0x0F6, false, vec![0x01, 0x02, 0xAB]);
        assert_eq!(frame.data_hex(), "0102AB");
        assert_eq!(frame.id_hex(), "0x0F6");
        assert_eq!(frame.dlc(), 3);

        let extended = CanFrame::new(0x18FF_50E5, true, vec![]);
        assert_eq!(extended.id_hex(), "0x18FF50E5");
        assert_eq!(extended.data_hex(), "");
    }

    #[test]
    fn content_ignores_timestamp() {
        let a = CanFrame::new(1, false, vec![1]);
        let mut b = a.clone();
        b.timestamp = a.timestamp + chrono::Duration::seconds(5);
        assert!(a.same_content(&b));

        b.data = vec![2];
        assert!(!a.same_content(&b));
    }
}
