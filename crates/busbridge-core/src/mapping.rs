//! Mapping definitions binding one field-bus data point to one MQTT topic.
//!
//! The JSON shape is flat: a Modbus mapping carries `device_id`, `register`
//! and `function_code` at the top level, a CAN mapping carries `can_id` and
//! `extended`. The bus is inferred from which fields are present.

use crate::topic::validate_topic;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Stable, opaque mapping identifier.
pub type MappingId = String;

/// Immutable snapshot of a mapping table, shared with running adapters.
pub type MappingSet = Arc<Vec<Mapping>>;

/// Highest addressable Modbus register.
pub const MAX_REGISTER: u32 = 0xFFFF;

/// Highest 29-bit CAN identifier.
pub const MAX_CAN_ID: u32 = 0x1FFF_FFFF;

/// Highest supported number of decimals in a scaled value.
pub const MAX_DECIMALS: u32 = 10;

/// The field bus a mapping reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Modbus RTU over RS-485
    Modbus,
    /// CAN bus
    Can,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Modbus => write!(f, "modbus"),
            BusKind::Can => write!(f, "can"),
        }
    }
}

/// Modbus read function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// FC3, read holding registers
    ReadHolding,
    /// FC4, read input registers
    ReadInput,
}

impl TryFrom<u8> for FunctionCode {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            3 => Ok(Self::ReadHolding),
            4 => Ok(Self::ReadInput),
            other => Err(ValidationError::UnsupportedFunctionCode(other)),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> Self {
        match code {
            FunctionCode::ReadHolding => 3,
            FunctionCode::ReadInput => 4,
        }
    }
}

/// MQTT delivery guarantee applied per mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    /// QoS 0
    AtMostOnce,
    /// QoS 1
    #[default]
    AtLeastOnce,
    /// QoS 2
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = ValidationError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(ValidationError::InvalidQos(other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Where a mapping reads its value from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Source {
    /// A single Modbus register on a serial device.
    Modbus {
        /// Device identifier known to the device manager
        device_id: String,
        /// Register address (0..=65535)
        register: u32,
        /// Read function, 3 or 4
        function_code: u8,
    },
    /// All frames carrying one CAN identifier.
    Can {
        /// Frame identifier (0..=0x1FFFFFFF)
        can_id: u32,
        /// Whether the identifier is a 29-bit extended id
        #[serde(default)]
        extended: bool,
    },
}

impl Source {
    /// The bus this source lives on.
    #[must_use]
    pub fn bus(&self) -> BusKind {
        match self {
            Source::Modbus { .. } => BusKind::Modbus,
            Source::Can { .. } => BusKind::Can,
        }
    }

    /// Modbus device id, if this is a Modbus source.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Source::Modbus { device_id, .. } => Some(device_id),
            Source::Can { .. } => None,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Source::Modbus {
                device_id,
                register,
                function_code,
            } => {
                if device_id.trim().is_empty() {
                    return Err(ValidationError::EmptyDeviceId);
                }
                if *register > MAX_REGISTER {
                    return Err(ValidationError::RegisterOutOfRange(*register));
                }
                FunctionCode::try_from(*function_code)?;
                Ok(())
            }
            Source::Can { can_id, .. } => {
                if *can_id > MAX_CAN_ID {
                    return Err(ValidationError::CanIdOutOfRange(*can_id));
                }
                Ok(())
            }
        }
    }
}

/// Linear scaling applied to Modbus readings: `round(raw * multiplier + offset, decimals)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    /// Factor applied to the raw register value
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Constant added after multiplication
    #[serde(default)]
    pub offset: f64,
    /// Number of decimals kept in the published value
    #[serde(default)]
    pub decimals: u32,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            offset: 0.0,
            decimals: 0,
        }
    }
}

impl Scaling {
    /// Create a scaling rule.
    #[must_use]
    pub fn new(multiplier: f64, offset: f64, decimals: u32) -> Self {
        Self {
            multiplier,
            offset,
            decimals,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if !self.multiplier.is_finite() {
            return Err(ValidationError::NonFiniteScaling("multiplier"));
        }
        if !self.offset.is_finite() {
            return Err(ValidationError::NonFiniteScaling("offset"));
        }
        if self.decimals > MAX_DECIMALS {
            return Err(ValidationError::TooManyDecimals(self.decimals));
        }
        Ok(())
    }
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// A configured rule binding one field-bus data point to one MQTT topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Stable identifier, assigned by the store when empty
    #[serde(default)]
    pub id: MappingId,
    /// Human readable name
    #[serde(default)]
    pub name: String,
    /// Bus data point
    #[serde(flatten)]
    pub source: Source,
    /// Target MQTT topic
    pub topic: String,
    /// Display unit (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Display name of the Modbus device (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Whether the mapping takes part in bridging
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Publish only when the value changed
    #[serde(default = "default_true")]
    pub publish_on_change: bool,
    /// Minimum time between two publishes
    #[serde(default)]
    pub min_interval_ms: u64,
    /// MQTT delivery guarantee
    #[serde(default)]
    pub qos: Qos,
    /// Optional scaling (Modbus only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<Scaling>,
}

impl Mapping {
    /// Create an enabled Modbus mapping with default publish policy.
    #[must_use]
    pub fn modbus(
        device_id: impl Into<String>,
        register: u32,
        function_code: u8,
        topic: impl Into<String>,
    ) -> Self {
        Self::with_source(
            Source::Modbus {
                device_id: device_id.into(),
                register,
                function_code,
            },
            topic,
        )
    }

    /// Create an enabled CAN mapping with default publish policy.
    #[must_use]
    pub fn can(can_id: u32, extended: bool, topic: impl Into<String>) -> Self {
        Self::with_source(Source::Can { can_id, extended }, topic)
    }

    fn with_source(source: Source, topic: impl Into<String>) -> Self {
        Self {
            id: MappingId::new(),
            name: String::new(),
            source,
            topic: topic.into(),
            unit: None,
            device_name: None,
            enabled: true,
            publish_on_change: true,
            min_interval_ms: 0,
            qos: Qos::default(),
            scaling: None,
        }
    }

    /// Parse and validate a mapping from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Malformed`] if the JSON does not describe a
    /// mapping, or the first field rule the mapping violates.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ValidationError> {
        let mapping: Self = serde_json::from_slice(bytes)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        mapping.validate()?;
        Ok(mapping)
    }

    /// Check every field rule.
    ///
    /// # Errors
    ///
    /// Returns the first rule the mapping violates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate()?;
        validate_topic(&self.topic)?;
        if let Some(scaling) = &self.scaling {
            if self.bus() != BusKind::Modbus {
                return Err(ValidationError::ScalingNotSupported);
            }
            scaling.validate()?;
        }
        Ok(())
    }

    /// The bus this mapping reads from.
    #[must_use]
    pub fn bus(&self) -> BusKind {
        self.source.bus()
    }

    /// Scaling rule, identity when none is configured.
    #[must_use]
    pub fn effective_scaling(&self) -> Scaling {
        self.scaling.unwrap_or_default()
    }

    /// Minimum interval between publishes.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Whether a received CAN frame belongs to this mapping.
    #[must_use]
    pub fn matches_frame(&self, frame_id: u32, frame_extended: bool) -> bool {
        matches!(
            self.source,
            Source::Can { can_id, extended } if can_id == frame_id && extended == frame_extended
        )
    }

    /// Name for logs and payloads, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Generate a fresh mapping id (`map_` followed by 12 hex digits).
#[must_use]
pub fn generate_id() -> MappingId {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("map_{}", &uuid[..12])
}

/// Find mappings sharing the same `(source, topic)` pair.
///
/// Duplicates are legal; callers surface them as soft warnings. Each returned
/// pair holds the earlier mapping id first.
#[must_use]
pub fn find_duplicate_routes(mappings: &[Mapping]) -> Vec<(MappingId, MappingId)> {
    let mut first_seen: HashMap<(&Source, &str), &MappingId> = HashMap::new();
    let mut duplicates = Vec::new();

    for mapping in mappings {
        let key = (&mapping.source, mapping.topic.as_str());
        match first_seen.get(&key) {
            Some(first) => duplicates.push(((*first).clone(), mapping.id.clone())),
            None => {
                first_seen.insert(key, &mapping.id);
            }
        }
    }

    duplicates
}

/// Field rule violations, reported synchronously at create/update.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Register address above 65535
    #[error("register {0} out of range 0..=65535")]
    RegisterOutOfRange(u32),
    /// Function code other than 3 or 4
    #[error("unsupported function code {0}, only 3 and 4 are supported")]
    UnsupportedFunctionCode(u8),
    /// CAN id above the 29-bit range
    #[error("CAN id 0x{0:X} out of range 0..=0x1FFFFFFF")]
    CanIdOutOfRange(u32),
    /// Modbus device id missing
    #[error("device_id must not be empty")]
    EmptyDeviceId,
    /// Topic missing
    #[error("topic must not be empty")]
    EmptyTopic,
    /// Topic contains `#` or `+`
    #[error("topic '{topic}' contains reserved wildcard '{wildcard}'")]
    WildcardInTopic {
        /// Offending topic
        topic: String,
        /// The wildcard character found
        wildcard: char,
    },
    /// Topic contains a NUL character
    #[error("topic must not contain NUL characters")]
    NulInTopic,
    /// Topic longer than MQTT allows
    #[error("topic is {0} bytes long, the maximum is 65535")]
    TopicTooLong(usize),
    /// QoS outside 0..=2
    #[error("invalid QoS {0}, expected 0, 1 or 2")]
    InvalidQos(u8),
    /// Scaling on a CAN mapping
    #[error("scaling is only supported for Modbus mappings")]
    ScalingNotSupported,
    /// NaN or infinite scaling factor
    #[error("scaling {0} must be a finite number")]
    NonFiniteScaling(&'static str),
    /// Too many decimals
    #[error("decimals {0} exceeds the maximum of {MAX_DECIMALS}")]
    TooManyDecimals(u32),
    /// Mapping stored in the bridge of the other bus
    #[error("{found} mapping cannot be stored in the {expected} bridge")]
    WrongBus {
        /// Bus of the bridge
        expected: BusKind,
        /// Bus of the mapping
        found: BusKind,
    },
    /// Input is not a mapping at all
    #[error("malformed mapping: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modbus_json_shape() {
        let json = br#"{
            "id": "map_1",
            "name": "Boiler temperature",
            "device_id": "dev1",
            "register": 10,
            "function_code": 3,
            "topic": "plant/boiler/temp",
            "unit": "C",
            "scaling": {"multiplier": 0.1, "offset": 0, "decimals": 1}
        }"#;

        let mapping = Mapping::from_json(json).unwrap();

        assert_eq!(mapping.bus(), BusKind::Modbus);
        assert_eq!(mapping.source.device_id(), Some("dev1"));
        assert!(mapping.enabled);
        assert!(mapping.publish_on_change);
        assert_eq!(mapping.min_interval_ms, 0);
        assert_eq!(mapping.qos, Qos::AtLeastOnce);
        assert_eq!(mapping.scaling, Some(Scaling::new(0.1, 0.0, 1)));
        assert_eq!(mapping.unit.as_deref(), Some("C"));

        let value = serde_json::to_value(&mapping).unwrap();
        assert_eq!(value["register"], 10);
        assert_eq!(value["function_code"], 3);
        assert_eq!(value["qos"], 1);
        assert!(value.get("can_id").is_none());
    }

    #[test]
    fn can_json_shape() {
        let json = br#"{"id": "map_2", "name": "Engine ECU", "can_id": 246,
            "topic": "vehicle/engine", "min_interval_ms": 100, "qos": 0}"#;

        let mapping = Mapping::from_json(json).unwrap();

        assert_eq!(mapping.bus(), BusKind::Can);
        assert!(mapping.matches_frame(0x0F6, false));
        assert!(!mapping.matches_frame(0x0F6, true));
        assert!(!mapping.matches_frame(0x100, false));
        assert_eq!(mapping.min_interval(), Duration::from_millis(100));
        assert_eq!(mapping.qos, Qos::AtMostOnce);
    }

    #[test]
    fn register_range_checked() {
        let mapping = Mapping::modbus("dev1", 65_536, 3, "a/b");
        assert_eq!(
            mapping.validate(),
            Err(ValidationError::RegisterOutOfRange(65_536))
        );
        assert!(Mapping::modbus("dev1", 65_535, 3, "a/b").validate().is_ok());
    }

    #[test]
    fn function_code_checked() {
        let mapping = Mapping::modbus("dev1", 1, 6, "a/b");
        assert_eq!(
            mapping.validate(),
            Err(ValidationError::UnsupportedFunctionCode(6))
        );
        assert!(Mapping::modbus("dev1", 1, 4, "a/b").validate().is_ok());
    }

    #[test]
    fn can_id_range_checked() {
        assert!(Mapping::can(MAX_CAN_ID, true, "a").validate().is_ok());
        assert_eq!(
            Mapping::can(MAX_CAN_ID + 1, true, "a").validate(),
            Err(ValidationError::CanIdOutOfRange(MAX_CAN_ID + 1))
        );
    }

    #[test]
    fn wildcard_topics_rejected() {
        let mapping = Mapping::can(1, false, "vehicle/+/speed");
        assert!(matches!(
            mapping.validate(),
            Err(ValidationError::WildcardInTopic { wildcard: '+', .. })
        ));
        assert_eq!(
            Mapping::can(1, false, "").validate(),
            Err(ValidationError::EmptyTopic)
        );
    }

    #[test]
    fn invalid_qos_is_malformed() {
        let json = br#"{"can_id": 1, "topic": "a", "qos": 3}"#;
        let err = Mapping::from_json(json).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(msg) if msg.contains("QoS 3")));
    }

    #[test]
    fn negative_interval_is_malformed() {
        let json = br#"{"can_id": 1, "topic": "a", "min_interval_ms": -5}"#;
        assert!(matches!(
            Mapping::from_json(json),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn scaling_rejected_on_can() {
        let mut mapping = Mapping::can(1, false, "a");
        mapping.scaling = Some(Scaling::new(2.0, 0.0, 0));
        assert_eq!(mapping.validate(), Err(ValidationError::ScalingNotSupported));
    }

    #[test]
    fn scaling_bounds() {
        let mut mapping = Mapping::modbus("dev1", 1, 3, "a");
        mapping.scaling = Some(Scaling::new(f64::NAN, 0.0, 0));
        assert_eq!(
            mapping.validate(),
            Err(ValidationError::NonFiniteScaling("multiplier"))
        );
        mapping.scaling = Some(Scaling::new(1.0, 0.0, 11));
        assert_eq!(mapping.validate(), Err(ValidationError::TooManyDecimals(11)));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_id();
        let b = generate_id();
        assert!(a.starts_with("map_"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn duplicate_routes_reported_not_rejected() {
        let mut a = Mapping::can(0x10, false, "t");
        a.id = "a".into();
        let mut b = Mapping::can(0x10, false, "t");
        b.id = "b".into();
        let mut c = Mapping::can(0x10, false, "other");
        c.id = "c".into();

        assert!(a.validate().is_ok() && b.validate().is_ok());
        assert_eq!(
            find_duplicate_routes(&[a, b, c]),
            vec![("a".to_string(), "b".to_string())]
        );
    }
}
