//! Turning raw bus readings into publishable values.
//!
//! Both buses go through the same [`Transform`] capability so the publish
//! gate never needs to know which bus a value came from:
//!
//! - [`RegisterScaling`] applies `round(raw * multiplier + offset, decimals)`
//!   to a Modbus register
//! - [`FramePackaging`] passes a CAN frame through unchanged

use crate::frame::CanFrame;
use crate::mapping::Scaling;

/// A value ready for the publish gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Scaled Modbus reading
    Scalar(f64),
    /// Verbatim CAN frame
    Frame(CanFrame),
}

impl Value {
    /// Whether two values are the same reading for change detection.
    ///
    /// Frames compare by id and payload; the receive time is ignored.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn same_reading(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::Frame(a), Value::Frame(b)) => a.same_content(b),
            _ => false,
        }
    }
}

/// Converts one raw reading into a [`Value`].
pub trait Transform {
    /// Raw input type.
    type Raw;

    /// Apply the transform.
    fn apply(&self, raw: Self::Raw) -> Value;
}

/// Linear scaling of a 16-bit Modbus register.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterScaling(pub Scaling);

impl Transform for RegisterScaling {
    type Raw = u16;

    fn apply(&self, raw: u16) -> Value {
        Value::Scalar(scale(raw, &self.0))
    }
}

/// Identity packaging of a CAN frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramePackaging;

impl Transform for FramePackaging {
    type Raw = CanFrame;

    fn apply(&self, raw: CanFrame) -> Value {
        Value::Frame(raw)
    }
}

/// Scale a register value.
#[must_use]
pub fn scale(raw: u16, scaling: &Scaling) -> f64 {
    round_to(
        f64::from(raw) * scaling.multiplier + scaling.offset,
        scaling.decimals,
    )
}

/// Round half away from zero to `decimals` places.
#[must_use]
pub fn round_to(value: f64, decimals: u32) -> f64 {
    #[allow(clippy::cast_possible_wrap)]
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
