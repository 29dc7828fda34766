//! Publish gate: change detection, rate limiting and debounce.
//!
//! The gate decides, for one mapping, whether a freshly transformed value is
//! forwarded to the broker now, later, or not at all.
//!
//! With `publish_on_change` a changed value that arrives inside the minimum
//! interval is kept as the single pending value and released by
//! [`GateState::take_due`] once the interval has elapsed. A later reading
//! replaces the pending one; a reading equal to the last published value
//! cancels it. Without `publish_on_change` the gate is a plain heartbeat and
//! readings inside the interval are suppressed.
//!
//! The interval is measured from the later of two instants: when the gate
//! last let a value through, and when the broker last accepted one. A value
//! that waited in the publish queue is held back again with
//! [`GateState::requeue`] if it would reach the broker too early.

use crate::mapping::Mapping;
use crate::transform::Value;
use std::time::Duration;
use tokio::time::Instant;

/// The publish policy of one mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    /// Mapping enabled
    pub enabled: bool,
    /// Publish only on value change
    pub publish_on_change: bool,
    /// Minimum time between publishes
    pub min_interval: Duration,
}

impl From<&Mapping> for GatePolicy {
    fn from(mapping: &Mapping) -> Self {
        Self {
            enabled: mapping.enabled,
            publish_on_change: mapping.publish_on_change,
            min_interval: mapping.min_interval(),
        }
    }
}

/// Outcome of offering a value to the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Forward this value now
    Publish(Value),
    /// Value held back until `due`
    Deferred {
        /// When the pending value becomes publishable
        due: Instant,
    },
    /// Value not forwarded
    Suppressed(Suppression),
}

/// Why a value was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Mapping disabled
    Disabled,
    /// Same as the last published value
    Unchanged,
    /// Heartbeat mode, inside the minimum interval
    RateLimited,
}

/// Per-mapping gate memory.
#[derive(Debug, Clone, Default)]
pub struct GateState {
    last_value: Option<Value>,
    last_at: Option<Instant>,
    pending: Option<Value>,
    sent_value: Option<Value>,
    sent_at: Option<Instant>,
}

impl GateState {
    /// Offer a new value at `now`.
    ///
    /// A [`Decision::Publish`] commits the value as the last published one.
    pub fn offer(&mut self, policy: &GatePolicy, value: Value, now: Instant) -> Decision {
        if !policy.enabled {
            self.pending = None;
            return Decision::Suppressed(Suppression::Disabled);
        }

        let interval_elapsed = self
            .reference()
            .map_or(true, |at| now.saturating_duration_since(at) >= policy.min_interval);

        if !policy.publish_on_change {
            if interval_elapsed {
                self.pending = None;
                self.commit(value.clone(), now);
                return Decision::Publish(value);
            }
            return Decision::Suppressed(Suppression::RateLimited);
        }

        let changed = self
            .last_value
            .as_ref()
            .map_or(true, |last| !last.same_reading(&value));

        if !changed {
            self.pending = None;
            return Decision::Suppressed(Suppression::Unchanged);
        }

        if interval_elapsed {
            self.pending = None;
            self.commit(value.clone(), now);
            return Decision::Publish(value);
        }

        self.pending = Some(value);
        match self.pending_due(policy) {
            Some(due) => Decision::Deferred { due },
            None => Decision::Deferred { due: now },
        }
    }

    /// Release the pending value if its interval has elapsed.
    pub fn take_due(&mut self, policy: &GatePolicy, now: Instant) -> Option<Value> {
        if !policy.enabled {
            self.pending = None;
            return None;
        }
        let due = self.pending_due(policy)?;
        if now < due {
            return None;
        }
        let value = self.pending.take()?;
        if policy.publish_on_change
            && self
                .last_value
                .as_ref()
                .is_some_and(|last| last.same_reading(&value))
        {
            return None;
        }
        self.commit(value.clone(), now);
        Some(value)
    }

    /// Whether a value let through earlier may reach the broker at `now`.
    #[must_use]
    pub fn send_allowed(&self, policy: &GatePolicy, now: Instant) -> bool {
        self.sent_at
            .map_or(true, |at| now.saturating_duration_since(at) >= policy.min_interval)
    }

    /// Record that the broker accepted `value` at `at`.
    pub fn mark_sent(&mut self, value: &Value, at: Instant) {
        self.sent_value = Some(value.clone());
        self.sent_at = Some(at);
    }

    /// Hold back a value that was let through but not yet sent.
    ///
    /// The gate goes back to what the broker last accepted. Returns `false`
    /// if a newer pending value already takes its place.
    pub fn requeue(&mut self, value: Value) -> bool {
        self.last_value = self.sent_value.clone();
        self.last_at = self.sent_at;
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(value);
        true
    }

    /// Remove the pending value, if any.
    pub fn take_pending(&mut self) -> Option<Value> {
        self.pending.take()
    }

    /// When the pending value becomes publishable, if there is one.
    #[must_use]
    pub fn pending_due(&self, policy: &GatePolicy) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(
            self.reference()
                .map_or_else(Instant::now, |at| at + policy.min_interval),
        )
    }

    /// Forget the last published value so the next reading is republished.
    ///
    /// Used when a publish failed. The rate-limit timestamp is kept.
    pub fn forget_value(&mut self) {
        self.last_value = None;
    }

    /// Last value the gate let through.
    #[must_use]
    pub fn last_value(&self) -> Option<&Value> {
        self.last_value.as_ref()
    }

    /// When the gate last let a value through.
    #[must_use]
    pub fn last_at(&self) -> Option<Instant> {
        self.last_at
    }

    /// Whether a value is waiting for its interval.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn reference(&self) -> Option<Instant> {
        self.last_at.max(self.sent_at)
    }

    fn commit(&mut self, value: Value, now: Instant) {
        self.last_value = Some(value);
        self.last_at = Some(now);
    }
}
