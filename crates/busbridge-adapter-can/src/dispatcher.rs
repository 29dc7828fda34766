//! Frame dispatch from the bus listener into the pipeline.

use busbridge_core::{
    CanFrame, FramePackaging, Mapping, MappingSet, Pipeline, RawValue, Source, Transform,
};
use busbridge_proto::FrameEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::listener::CanListener;

/// Bus scope under which CAN connectivity is reported.
pub const CAN_SCOPE: &str = "can";

/// Configuration for the CAN dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Quiet period after which the bus is reported disconnected
    pub silence_timeout: Duration,
    /// Wait before subscribing again to a closed listener
    pub resubscribe_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(5),
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}

/// Enabled CAN mappings keyed by `(can_id, extended)`.
#[derive(Debug, Default)]
struct FrameIndex {
    routes: HashMap<(u32, bool), Vec<Mapping>>,
}

impl FrameIndex {
    fn build(mappings: &[Mapping]) -> Self {
        let mut routes: HashMap<(u32, bool), Vec<Mapping>> = HashMap::new();
        for mapping in mappings.iter().filter(|m| m.enabled) {
            if let Source::Can { can_id, extended } = mapping.source {
                routes.entry((can_id, extended)).or_default().push(mapping.clone());
            }
        }
        Self { routes }
    }

    fn matching(&self, frame: &CanFrame) -> &[Mapping] {
        self.routes
            .get(&(frame.id, frame.extended))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Routes every received frame to the mappings listening for its id.
pub struct CanDispatcher {
    listener: Arc<dyn CanListener>,
    pipeline: Arc<Pipeline>,
    config: DispatcherConfig,
    live: broadcast::Sender<FrameEvent>,
}

impl CanDispatcher {
    /// Create a dispatcher. Every received frame is also sent on `live`.
    #[must_use]
    pub fn new(
        listener: Arc<dyn CanListener>,
        pipeline: Arc<Pipeline>,
        config: DispatcherConfig,
        live: broadcast::Sender<FrameEvent>,
    ) -> Self {
        Self {
            listener,
            pipeline,
            config,
            live,
        }
    }

    /// Check the interface before starting.
    ///
    /// A down interface is not an error; it is returned as a warning and the
    /// bus is reported disconnected until traffic shows up.
    #[must_use]
    pub fn attach(&self) -> Vec<String> {
        self.pipeline.set_bus_connected(CAN_SCOPE, false);
        if self.listener.is_up() {
            Vec::new()
        } else {
            tracing::warn!("CAN interface is down, waiting for traffic");
            vec!["CAN interface is down; the bridge will resume when frames arrive".to_string()]
        }
    }

    /// Subscribe to the listener and start dispatching until `cancel` fires.
    pub fn spawn(
        self: &Arc<Self>,
        mappings: watch::Receiver<MappingSet>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = self.listener.subscribe();
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.run(rx, mappings, cancel).await })
    }

    async fn run(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<CanFrame>,
        mut mappings: watch::Receiver<MappingSet>,
        cancel: CancellationToken,
    ) {
        let mut index = FrameIndex::build(&mappings.borrow_and_update());
        let mut connected = false;
        let mut silence_deadline = Instant::now() + self.config.silence_timeout;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                changed = mappings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    index = FrameIndex::build(&mappings.borrow_and_update());
                    tracing::debug!(routes = index.routes.len(), "CAN routes reloaded");
                }
                received = rx.recv() => match received {
                    Ok(frame) => {
                        if !connected {
                            connected = true;
                            self.pipeline.set_bus_connected(CAN_SCOPE, true);
                            tracing::info!("CAN traffic seen, bus connected");
                        }
                        silence_deadline = Instant::now() + self.config.silence_timeout;
                        self.dispatch(&index, frame);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "CAN dispatcher lagging, frames skipped");
                    }
                    Err(RecvError::Closed) => {
                        connected = false;
                        self.pipeline.set_bus_connected(CAN_SCOPE, false);
                        tracing::warn!("CAN listener closed, resubscribing");
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = time::sleep(self.config.resubscribe_delay) => {}
                        }
                        rx = self.listener.subscribe();
                    }
                },
                () = time::sleep_until(silence_deadline), if connected => {
                    connected = false;
                    self.pipeline.set_bus_connected(CAN_SCOPE, false);
                    tracing::warn!(
                        silence_ms = self.config.silence_timeout.as_millis(),
                        "No CAN traffic, bus disconnected"
                    );
                }
            }
        }
        tracing::debug!("CAN dispatcher stopped");
    }

    fn dispatch(&self, index: &FrameIndex, frame: CanFrame) {
        // no live subscribers is fine
        let _ = self.live.send(FrameEvent::from(&frame));

        let matching = index.matching(&frame);
        if matching.is_empty() {
            return;
        }
        let raw = frame.data_hex();
        for mapping in matching {
            let value = FramePackaging.apply(frame.clone());
            self.pipeline
                .ingest(&mapping.id, RawValue::Frame(raw.clone()), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::CanHub;
    use busbridge_core::Value;

    fn can_mapping(id: &str, can_id: u32) -> Mapping {
        let mut mapping = Mapping::can(can_id, false, format!("vehicle/{id}"));
        mapping.id = id.into();
        mapping
    }

    struct Harness {
        hub: Arc<CanHub>,
        pipeline: Arc<Pipeline>,
        dispatcher: Arc<CanDispatcher>,
        mappings: watch::Sender<MappingSet>,
        live: broadcast::Sender<FrameEvent>,
    }

    fn harness(mappings: Vec<Mapping>) -> Harness {
        let hub = Arc::new(CanHub::new(64));
        hub.set_up(true);
        let pipeline = Arc::new(Pipeline::new(64));
        pipeline.activate(&mappings);
        let (live, _) = broadcast::channel(64);
        let dispatcher = Arc::new(CanDispatcher::new(
            Arc::clone(&hub) as Arc<dyn CanListener>,
            Arc::clone(&pipeline),
            DispatcherConfig::default(),
            live.clone(),
        ));
        let (tx, _) = watch::channel(Arc::new(mappings));
        Harness {
            hub,
            pipeline,
            dispatcher,
            mappings: tx,
            live,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn matching_frames_only() {
        let h = harness(vec![can_mapping("engine", 0x0F6)]);
        let cancel = CancellationToken::new();
        let handle = h.dispatcher.spawn(h.mappings.subscribe(), cancel.clone());

        h.hub.publish(CanFrame::new(0x0F6, false, vec![0x01, 0x02]));
        h.hub.publish(CanFrame::new(0x100, false, vec![0x03]));
        h.hub.publish(CanFrame::new(0x0F6, true, vec![0x04]));
        time::sleep(Duration::from_millis(10)).await;

        let item = h.pipeline.queue().try_pop().unwrap();
        assert_eq!(item.topic, "vehicle/engine");
        match item.value {
            Value::Frame(frame) => assert_eq!(frame.data_hex(), "0102"),
            Value::Scalar(v) => panic!("unexpected scalar {v}"),
        }
        assert!(h.pipeline.queue().is_empty());
        assert_eq!(
            h.pipeline.mapping_state("engine").unwrap().messages_received,
            1
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_marks_bus_down_until_traffic_returns() {
        let h = harness(vec![can_mapping("engine", 0x0F6)]);
        assert!(h.dispatcher.attach().is_empty());
        let cancel = CancellationToken::new();
        let handle = h.dispatcher.spawn(h.mappings.subscribe(), cancel.clone());

        assert!(!h.pipeline.bus_connected());
        h.hub.publish(CanFrame::new(0x0F6, false, vec![1]));
        time::sleep(Duration::from_millis(10)).await;
        assert!(h.pipeline.bus_connected());

        time::sleep(Duration::from_secs(6)).await;
        assert!(!h.pipeline.bus_connected());

        h.hub.publish(CanFrame::new(0x0F6, false, vec![2]));
        time::sleep(Duration::from_millis(10)).await;
        assert!(h.pipeline.bus_connected());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn route_changes_apply_to_next_frame() {
        let h = harness(vec![can_mapping("engine", 0x0F6)]);
        let cancel = CancellationToken::new();
        let handle = h.dispatcher.spawn(h.mappings.subscribe(), cancel.clone());

        let updated = vec![can_mapping("engine", 0x0F6), can_mapping("brake", 0x100)];
        h.pipeline.activate(&updated);
        h.mappings.send_replace(Arc::new(updated));
        h.hub.publish(CanFrame::new(0x100, false, vec![9]));
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.pipeline.queue().try_pop().unwrap().topic, "vehicle/brake");

        let mut disabled = can_mapping("brake", 0x100);
        disabled.enabled = false;
        h.mappings.send_replace(Arc::new(vec![disabled]));
        h.hub.publish(CanFrame::new(0x100, false, vec![10]));
        time::sleep(Duration::from_millis(10)).await;
        assert!(h.pipeline.queue().is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn every_frame_goes_live() {
        let h = harness(vec![]);
        let mut live = h.live.subscribe();
        let cancel = CancellationToken::new();
        let handle = h.dispatcher.spawn(h.mappings.subscribe(), cancel.clone());

        h.hub.publish(CanFrame::new(0x7FF, false, vec![0xAA]));
        let event = live.recv().await.unwrap();
        assert_eq!(event.can_id, 0x7FF);
        assert_eq!(event.direction, "RX");
        assert_eq!(event.data, vec![0xAA]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn down_interface_is_a_warning() {
        let h = harness(vec![]);
        h.hub.set_up(false);
        assert_eq!(h.dispatcher.attach().len(), 1);
        assert!(!h.pipeline.bus_connected());
    }
}
