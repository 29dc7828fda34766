//! MQTT payload encoding.

use busbridge_core::{CanFrame, Outgoing, Value};
use serde::{Deserialize, Serialize};

/// JSON body published for a CAN mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanPayload {
    /// Frame id, `0x%03X` or `0x%08X` for extended ids
    pub can_id: String,
    /// Payload bytes as upper-case hex
    pub data: String,
    /// Data length code
    pub dlc: usize,
    /// Receive time, RFC 3339
    pub timestamp: String,
    /// Extended id flag
    pub extended: bool,
    /// Mapping name
    pub mapping: String,
}

impl CanPayload {
    /// Build the payload for a frame routed through `mapping`.
    #[must_use]
    pub fn new(frame: &CanFrame, mapping: &str) -> Self {
        Self {
            can_id: frame.id_hex(),
            data: frame.data_hex(),
            dlc: frame.dlc(),
            timestamp: frame.timestamp.to_rfc3339(),
            extended: frame.extended,
            mapping: mapping.to_string(),
        }
    }
}

/// Encode the MQTT body of a queued publish.
///
/// Scalars are rendered with exactly `decimals` fractional digits, so a
/// reading of `25.0` with one decimal is published as `25.0`.
///
/// # Errors
///
/// Returns error if a scalar is not finite or JSON encoding fails.
pub fn encode_payload(item: &Outgoing) -> Result<Vec<u8>, PayloadError> {
    match &item.value {
        Value::Scalar(v) => {
            if !v.is_finite() {
                return Err(PayloadError::NonFinite(*v));
            }
            let decimals = item.decimals as usize;
            Ok(format!("{v:.decimals$}").into_bytes())
        }
        Value::Frame(frame) => serde_json::to_vec(&CanPayload::new(frame, &item.mapping_name))
            .map_err(|e| PayloadError::Serialize(e.to_string())),
    }
}

/// Payload encoding errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PayloadError {
    /// NaN or infinite scalar
    #[error("cannot publish non-finite value {0}")]
    NonFinite(f64),
    /// JSON encoding failed
    #[error("payload serialization failed: {0}")]
    Serialize(String),
}
