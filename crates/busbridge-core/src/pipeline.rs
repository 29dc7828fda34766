//! The synchronized path from a raw reading to the publish queue.
//!
//! A [`Pipeline`] lives for one bridge session. Adapters feed it readings,
//! the publisher worker drains its queue and reports back, and the status
//! API takes copies of the runtime state. All per-mapping state sits behind
//! one lock, so counters, gate memory and queue admission for a reading are
//! updated together.

use crate::gate::{Decision, GatePolicy, GateState, Suppression};
use crate::mapping::{Mapping, MappingId};
use crate::queue::{Outgoing, PublishQueue, PushOutcome};
use crate::runtime::{MappingRuntimeState, RawValue};
use crate::transform::Value;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What happened to a reading handed to [`Pipeline::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Queued for publishing
    Queued,
    /// Held back by the gate until the interval elapses
    Deferred,
    /// Not forwarded
    Suppressed(Suppression),
    /// Mapping is not active in this session
    Inactive,
}

/// Why a publish never reached the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Broker not connected
    BrokerUnavailable,
    /// Replaced by a newer reading of the same mapping
    Superseded,
    /// Pushed out of a full queue
    Evicted,
    /// Bridge stopping
    Shutdown,
    /// Publish attempt failed
    PublishFailed(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::BrokerUnavailable => write!(f, "broker unavailable"),
            DropReason::Superseded => write!(f, "superseded by a newer reading"),
            DropReason::Evicted => write!(f, "evicted from full publish queue"),
            DropReason::Shutdown => write!(f, "bridge stopping"),
            DropReason::PublishFailed(e) => write!(f, "publish failed: {e}"),
        }
    }
}

#[derive(Debug)]
struct Entry {
    mapping: Mapping,
    policy: GatePolicy,
    gate: GateState,
    state: MappingRuntimeState,
}

impl Entry {
    fn new(mapping: &Mapping) -> Self {
        Self {
            mapping: mapping.clone(),
            policy: GatePolicy::from(mapping),
            gate: GateState::default(),
            state: MappingRuntimeState::default(),
        }
    }
}

/// Transform output to publish queue, with runtime bookkeeping.
#[derive(Debug)]
pub struct Pipeline {
    entries: Mutex<HashMap<MappingId, Entry>>,
    queue: PublishQueue,
    flush: Notify,
    buses: Mutex<BTreeMap<String, bool>>,
    seq: AtomicU64,
}

impl Pipeline {
    /// Create a pipeline whose publish queue holds `queue_capacity` items.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            queue: PublishQueue::new(queue_capacity),
            flush: Notify::new(),
            buses: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Make exactly `mappings` active.
    ///
    /// New mappings start with empty runtime state, changed ones keep their
    /// state and gate memory, and mappings no longer listed are dropped.
    pub fn activate(&self, mappings: &[Mapping]) {
        let mut entries = self.entries.lock();
        let keep: HashSet<&str> = mappings.iter().map(|m| m.id.as_str()).collect();
        entries.retain(|id, _| keep.contains(id.as_str()));

        for mapping in mappings {
            match entries.get_mut(&mapping.id) {
                Some(entry) => {
                    entry.policy = GatePolicy::from(mapping);
                    entry.mapping = mapping.clone();
                }
                None => {
                    entries.insert(mapping.id.clone(), Entry::new(mapping));
                }
            }
        }
        drop(entries);
        self.flush.notify_one();
    }

    /// Feed one transformed reading through the gate.
    pub fn ingest(&self, mapping_id: &str, raw: RawValue, value: Value) -> IngestOutcome {
        self.ingest_at(mapping_id, raw, value, Instant::now(), Utc::now())
    }

    /// [`Pipeline::ingest`] with explicit clocks.
    pub fn ingest_at(
        &self,
        mapping_id: &str,
        raw: RawValue,
        value: Value,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> IngestOutcome {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(mapping_id) else {
            return IngestOutcome::Inactive;
        };

        entry.state.record_received(raw, wall);

        // a pending value that is already due goes out before the new reading
        let flushed = entry
            .gate
            .take_due(&entry.policy, now)
            .map(|v| self.outgoing(&entry.mapping, v));

        let decision = entry.gate.offer(&entry.policy, value, now);
        tracing::debug!(mapping_id, ?decision, "gate decision");

        let (fresh, outcome) = match decision {
            Decision::Publish(v) => (
                Some(self.outgoing(&entry.mapping, v)),
                IngestOutcome::Queued,
            ),
            Decision::Deferred { .. } => (None, IngestOutcome::Deferred),
            Decision::Suppressed(reason) => (None, IngestOutcome::Suppressed(reason)),
        };

        for item in flushed.into_iter().chain(fresh) {
            self.enqueue(&mut entries, item);
        }
        drop(entries);

        if outcome == IngestOutcome::Deferred {
            self.flush.notify_one();
        }
        outcome
    }

    /// Count a failed bus read against a mapping.
    pub fn record_read_error(&self, mapping_id: &str, error: &str) {
        if let Some(entry) = self.entries.lock().get_mut(mapping_id) {
            entry.state.record_read_error(error);
        }
    }

    /// Queue every pending value whose interval has elapsed.
    ///
    /// Returns the number of values queued.
    pub fn flush_due(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let due: Vec<Outgoing> = entries
            .values_mut()
            .filter_map(|entry| {
                entry
                    .gate
                    .take_due(&entry.policy, now)
                    .map(|v| self.outgoing(&entry.mapping, v))
            })
            .collect();

        let count = due.len();
        for item in due {
            self.enqueue(&mut entries, item);
        }
        count
    }

    /// Earliest instant at which a pending value becomes due.
    #[must_use]
    pub fn next_flush_at(&self) -> Option<Instant> {
        self.entries
            .lock()
            .values()
            .filter_map(|entry| entry.gate.pending_due(&entry.policy))
            .min()
    }

    /// Resolves when a value is deferred or the active set changes.
    pub fn flush_notified(&self) -> Notified<'_> {
        self.flush.notified()
    }

    /// Check, right before sending, that `item` keeps its mapping's minimum
    /// interval to the last publish the broker accepted.
    ///
    /// Returns `false` if the item must not be sent now. It is then either
    /// handed back to the gate as the pending value, or counted as
    /// superseded when a newer pending value exists.
    pub fn admit(&self, item: &Outgoing, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&item.mapping_id) else {
            return true;
        };
        if entry.gate.send_allowed(&entry.policy, now) {
            return true;
        }

        if entry.gate.requeue(item.value.clone()) {
            tracing::debug!(
                mapping_id = %item.mapping_id,
                seq = item.seq,
                "publish held back by rate limit"
            );
            drop(entries);
            self.flush.notify_one();
        } else {
            Self::account_drop(&mut entries, item, &DropReason::Superseded);
        }
        false
    }

    /// Record a publish acknowledged by the broker.
    pub fn record_published(&self, item: &Outgoing, at: DateTime<Utc>) {
        self.record_published_at(item, Instant::now(), at);
    }

    /// [`Pipeline::record_published`] with explicit clocks.
    pub fn record_published_at(&self, item: &Outgoing, now: Instant, wall: DateTime<Utc>) {
        if let Some(entry) = self.entries.lock().get_mut(&item.mapping_id) {
            entry.gate.mark_sent(&item.value, now);
            entry.state.record_published(&item.value, wall);
        }
    }

    /// Record a publish that never reached the broker.
    ///
    /// If the dropped value is still what the gate remembers as published,
    /// the gate forgets it so an unchanged reading is sent again later.
    pub fn record_dropped(&self, item: &Outgoing, reason: &DropReason) {
        let mut entries = self.entries.lock();
        Self::account_drop(&mut entries, item, reason);
    }

    /// Mark one bus scope (a Modbus device, or the CAN interface) up or down.
    ///
    /// Returns `true` if the state changed.
    pub fn set_bus_connected(&self, scope: &str, connected: bool) -> bool {
        let mut buses = self.buses.lock();
        buses.insert(scope.to_string(), connected) != Some(connected)
    }

    /// Forget a bus scope that is no longer polled.
    pub fn clear_bus(&self, scope: &str) {
        self.buses.lock().remove(scope);
    }

    /// Whether every known bus scope is up. `false` if none is known.
    #[must_use]
    pub fn bus_connected(&self) -> bool {
        let buses = self.buses.lock();
        !buses.is_empty() && buses.values().all(|up| *up)
    }

    /// Copy of every bus scope state.
    #[must_use]
    pub fn bus_states(&self) -> BTreeMap<String, bool> {
        self.buses.lock().clone()
    }

    /// Copy of all runtime state, keyed by mapping id.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<MappingId, MappingRuntimeState> {
        self.entries
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state.clone()))
            .collect()
    }

    /// Copy of one mapping's runtime state.
    #[must_use]
    pub fn mapping_state(&self, mapping_id: &str) -> Option<MappingRuntimeState> {
        self.entries
            .lock()
            .get(mapping_id)
            .map(|entry| entry.state.clone())
    }

    /// Zero all counters and timestamps. Gate memory is left alone.
    pub fn reset_statistics(&self) {
        for entry in self.entries.lock().values_mut() {
            entry.state.reset_counters();
        }
    }

    /// Number of active mappings.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// The publish queue.
    #[must_use]
    pub fn queue(&self) -> &PublishQueue {
        &self.queue
    }

    /// Close the queue and count everything still queued or pending in a
    /// gate as dropped.
    ///
    /// Returns the number of dropped values.
    pub fn shutdown(&self) -> usize {
        self.queue.close();
        let leftover = self.queue.drain();
        let mut entries = self.entries.lock();
        for item in &leftover {
            Self::account_drop(&mut entries, item, &DropReason::Shutdown);
        }

        let mut pending = 0;
        for entry in entries.values_mut() {
            if entry.gate.take_pending().is_some() {
                entry.state.record_dropped(DropReason::Shutdown.to_string());
                pending += 1;
            }
        }
        leftover.len() + pending
    }

    fn outgoing(&self, mapping: &Mapping, value: Value) -> Outgoing {
        Outgoing {
            mapping_id: mapping.id.clone(),
            mapping_name: mapping.display_name().to_string(),
            topic: mapping.topic.clone(),
            qos: mapping.qos,
            value,
            decimals: mapping.effective_scaling().decimals,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn enqueue(&self, entries: &mut HashMap<MappingId, Entry>, item: Outgoing) {
        match self.queue.push(item) {
            PushOutcome::Queued => {}
            PushOutcome::Superseded(old) => {
                tracing::debug!(
                    mapping_id = %old.mapping_id,
                    seq = old.seq,
                    "queued value superseded"
                );
                if let Some(entry) = entries.get_mut(&old.mapping_id) {
                    entry.state.record_dropped(DropReason::Superseded.to_string());
                }
            }
            PushOutcome::Evicted(old) => {
                tracing::debug!(
                    mapping_id = %old.mapping_id,
                    seq = old.seq,
                    "queued value evicted"
                );
                Self::account_drop(entries, &old, &DropReason::Evicted);
            }
            PushOutcome::Closed(item) => {
                Self::account_drop(entries, &item, &DropReason::Shutdown);
            }
        }
    }

    fn account_drop(
        entries: &mut HashMap<MappingId, Entry>,
        item: &Outgoing,
        reason: &DropReason,
    ) {
        tracing::debug!(
            mapping_id = %item.mapping_id,
            topic = %item.topic,
            %reason,
            "publish dropped"
        );
        let Some(entry) = entries.get_mut(&item.mapping_id) else {
            return;
        };
        entry.state.record_dropped(reason.to_string());
        if entry
            .gate
            .last_value()
            .is_some_and(|last| last.same_reading(&item.value))
        {
            entry.gate.forget_value();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CanFrame;
    use crate::mapping::Scaling;
    use std::time::Duration;

    fn modbus(id: &str, interval_ms: u64) -> Mapping {
        let mut mapping = Mapping::modbus("dev1", 10, 3, format!("plant/{id}"));
        mapping.id = id.into();
        mapping.min_interval_ms = interval_ms;
        mapping.scaling = Some(Scaling::new(0.1, 0.0, 1));
        mapping
    }

    fn reading(pipeline: &Pipeline, id: &str, raw: u16, now: Instant) -> IngestOutcome {
        pipeline.ingest_at(
            id,
            RawValue::Register(raw),
            Value::Scalar(f64::from(raw) / 10.0),
            now,
            Utc::now(),
        )
    }

    #[test]
    fn inactive_mappings_ignored() {
        let pipeline = Pipeline::new(8);
        assert_eq!(
            reading(&pipeline, "missing", 1, Instant::now()),
            IngestOutcome::Inactive
        );
        assert!(pipeline.queue().is_empty());
    }

    #[test]
    fn readings_counted_and_queued() {
        let pipeline = Pipeline::new(8);
        pipeline.activate(&[modbus("m1", 0)]);
        let now = Instant::now();

        assert_eq!(reading(&pipeline, "m1", 250, now), IngestOutcome::Queued);
        assert_eq!(
            reading(&pipeline, "m1", 250, now),
            IngestOutcome::Suppressed(Suppression::Unchanged)
        );

        let state = pipeline.mapping_state("m1").unwrap();
        assert_eq!(state.messages_received, 2);
        assert_eq!(state.last_raw_value, Some(RawValue::Register(250)));

        let item = pipeline.queue().try_pop().unwrap();
        assert_eq!(item.topic, "plant/m1");
        assert_eq!(item.decimals, 1);
        assert_eq!(item.value, Value::Scalar(25.0));
    }

    #[test]
    fn due_pending_goes_out_before_new_reading() {
        let pipeline = Pipeline::new(8);
        pipeline.activate(&[modbus("m1", 1000)]);
        let start = Instant::now();

        reading(&pipeline, "m1", 10, start);
        assert_eq!(
            reading(&pipeline, "m1", 20, start + Duration::from_millis(100)),
            IngestOutcome::Deferred
        );
        assert_eq!(
            pipeline.next_flush_at(),
            Some(start + Duration::from_millis(1000))
        );

        assert_eq!(
            reading(&pipeline, "m1", 30, start + Duration::from_millis(1000)),
            IngestOutcome::Deferred
        );
        let values: Vec<Value> = std::iter::from_fn(|| pipeline.queue().try_pop())
            .map(|i| i.value)
            .collect();
        assert_eq!(values, vec![Value::Scalar(1.0), Value::Scalar(2.0)]);
    }

    #[test]
    fn flush_due_releases_pending() {
        let pipeline = Pipeline::new(8);
        pipeline.activate(&[modbus("m1", 500)]);
        let start = Instant::now();

        reading(&pipeline, "m1", 10, start);
        reading(&pipeline, "m1", 20, start + Duration::from_millis(10));
        pipeline.queue().try_pop();

        assert_eq!(pipeline.flush_due(start + Duration::from_millis(100)), 0);
        assert_eq!(pipeline.flush_due(start + Duration::from_millis(500)), 1);
        assert_eq!(
            pipeline.queue().try_pop().map(|i| i.value),
            Some(Value::Scalar(2.0))
        );
        assert_eq!(pipeline.next_flush_at(), None);
    }

    #[test]
    fn dropped_publish_is_retried_on_next_reading() {
        let pipeline = Pipeline::new(8);
        pipeline.activate(&[modbus("m1", 0)]);
        let now = Instant::now();

        reading(&pipeline, "m1", 42, now);
        let item = pipeline.queue().try_pop().unwrap();
        pipeline.record_dropped(&item, &DropReason::BrokerUnavailable);

        assert_eq!(reading(&pipeline, "m1", 42, now), IngestOutcome::Queued);
        let state = pipeline.mapping_state("m1").unwrap();
        assert_eq!(state.messages_dropped, 1);
        assert_eq!(state.last_error.as_deref(), Some("broker unavailable"));
    }

    #[test]
    fn eviction_accounted_to_loser() {
        let pipeline = Pipeline::new(1);
        pipeline.activate(&[modbus("a", 0), modbus("b", 0)]);
        let now = Instant::now();

        reading(&pipeline, "a", 1, now);
        reading(&pipeline, "b", 2, now);

        assert_eq!(pipeline.queue().len(), 1);
        assert_eq!(pipeline.mapping_state("a").unwrap().messages_dropped, 1);
        assert_eq!(pipeline.mapping_state("b").unwrap().messages_dropped, 0);
        // the evicted value was forgotten, so it is sent again
        assert_eq!(reading(&pipeline, "a", 1, now), IngestOutcome::Queued);
    }

    #[test]
    fn superseded_within_mapping() {
        let pipeline = Pipeline::new(1);
        pipeline.activate(&[modbus("a", 0)]);
        let now = Instant::now();

        reading(&pipeline, "a", 1, now);
        reading(&pipeline, "a", 2, now);

        assert_eq!(
            pipeline.queue().try_pop().map(|i| i.value),
            Some(Value::Scalar(0.2))
        );
        assert_eq!(pipeline.mapping_state("a").unwrap().messages_dropped, 1);
    }

    #[test]
    fn activation_keeps_and_removes_state() {
        let pipeline = Pipeline::new(8);
        pipeline.activate(&[modbus("a", 0), modbus("b", 0)]);
        reading(&pipeline, "a", 1, Instant::now());

        let mut disabled = modbus("a", 0);
        disabled.enabled = false;
        pipeline.activate(&[disabled]);

        assert_eq!(pipeline.active_count(), 1);
        assert_eq!(pipeline.mapping_state("a").unwrap().messages_received, 1);
        assert!(pipeline.mapping_state("b").is_none());
        assert_eq!(
            reading(&pipeline, "a", 5, Instant::now()),
            IngestOutcome::Suppressed(Suppression::Disabled)
        );
    }

    #[test]
    fn published_and_reset() {
        let pipeline = Pipeline::new(8);
        pipeline.activate(&[modbus("a", 0)]);
        reading(&pipeline, "a", 250, Instant::now());
        let item = pipeline.queue().try_pop().unwrap();
        pipeline.record_published(&item, Utc::now());

        let state = pipeline.mapping_state("a").unwrap();
        assert_eq!(state.messages_published, 1);
        assert_eq!(state.last_published_value, Some(serde_json::json!(25.0)));

        pipeline.reset_statistics();
        let state = pipeline.mapping_state("a").unwrap();
        assert_eq!(state.messages_published, 0);
        assert_eq!(state.messages_received, 0);
        // gate memory survives a reset
        assert_eq!(
            reading(&pipeline, "a", 250, Instant::now()),
            IngestOutcome::Suppressed(Suppression::Unchanged)
        );
    }

    #[test]
    fn bus_scopes() {
        let pipeline = Pipeline::new(8);
        assert!(!pipeline.bus_connected());

        assert!(pipeline.set_bus_connected("dev1", true));
        assert!(!pipeline.set_bus_connected("dev1", true));
        pipeline.set_bus_connected("dev2", false);
        assert!(!pipeline.bus_connected());

        pipeline.clear_bus("dev2");
        assert!(pipeline.bus_connected());
    }

    #[test]
    fn shutdown_drops_leftovers() {
        let pipeline = Pipeline::new(8);
        let mut can = Mapping::can(0x0F6, false, "vehicle/engine");
        can.id = "c".into();
        pipeline.activate(&[can]);

        let frame = CanFrame::new(0x0F6, false, vec![1, 2]);
        pipeline.ingest("c", RawValue::Frame(frame.data_hex()), Value::Frame(frame));

        assert_eq!(pipeline.shutdown(), 1);
        let state = pipeline.mapping_state("c").unwrap();
        assert_eq!(state.messages_dropped, 1);
        assert_eq!(state.last_error.as_deref(), Some("bridge stopping"));
    }

    #[test]
    fn early_send_goes_back_to_gate() {
        let pipeline = Pipeline::new(8);
        pipeline.activate(&[modbus("a", 1000)]);
        let start = Instant::now();
        let at = |ms| start + Duration::from_millis(ms);

        reading(&pipeline, "a", 10, start);
        let first = pipeline.queue().try_pop().unwrap();
        assert!(pipeline.admit(&first, start));
        reading(&pipeline, "a", 20, at(100));
        assert_eq!(pipeline.flush_due(at(1000)), 1);
        let second = pipeline.queue().try_pop().unwrap();

        // the broker acknowledges the first value late
        pipeline.record_published_at(&first, at(1500), Utc::now());
        assert!(!pipeline.admit(&second, at(1500)));
        assert_eq!(pipeline.next_flush_at(), Some(at(2500)));

        assert_eq!(pipeline.flush_due(at(2000)), 0);
        assert_eq!(pipeline.flush_due(at(2500)), 1);
        let retried = pipeline.queue().try_pop().unwrap();
        assert_eq!(retried.value, Value::Scalar(2.0));
        assert!(pipeline.admit(&retried, at(2500)));
        assert_eq!(pipeline.mapping_state("a").unwrap().messages_dropped, 0);
    }

    #[test]
    fn early_send_superseded_by_newer_reading() {
        let pipeline = Pipeline::new(8);
        pipeline.activate(&[modbus("a", 1000)]);
        let start = Instant::now();
        let at = |ms| start + Duration::from_millis(ms);

        reading(&pipeline, "a", 10, start);
        let first = pipeline.queue().try_pop().unwrap();
        reading(&pipeline, "a", 20, at(100));
        assert_eq!(pipeline.flush_due(at(1000)), 1);
        let second = pipeline.queue().try_pop().unwrap();
        assert_eq!(reading(&pipeline, "a", 30, at(1200)), IngestOutcome::Deferred);

        pipeline.record_published_at(&first, at(1500), Utc::now());
        assert!(!pipeline.admit(&second, at(1500)));
        let state = pipeline.mapping_state("a").unwrap();
        assert_eq!(state.messages_dropped, 1);
        assert_eq!(state.last_error.as_deref(), Some("superseded by a newer reading"));

        assert_eq!(pipeline.flush_due(at(2500)), 1);
        assert_eq!(
            pipeline.queue().try_pop().map(|i| i.value),
            Some(Value::Scalar(3.0))
        );
    }

    #[test]
    fn shutdown_counts_pending_values() {
        let pipeline = Pipeline::new(8);
        pipeline.activate(&[modbus("a", 1000)]);
        let start = Instant::now();

        reading(&pipeline, "a", 10, start);
        pipeline.queue().try_pop();
        assert_eq!(
            reading(&pipeline, "a", 20, start + Duration::from_millis(100)),
            IngestOutcome::Deferred
        );

        assert_eq!(pipeline.shutdown(), 1);
        let state = pipeline.mapping_state("a").unwrap();
        assert_eq!(state.messages_dropped, 1);
        assert_eq!(state.last_error.as_deref(), Some("bridge stopping"));
        assert_eq!(pipeline.next_flush_at(), None);
    }
}
