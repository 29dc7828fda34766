//! Broker client and the publisher worker draining the pipeline queue.

use async_trait::async_trait;
use busbridge_core::{Backoff, DropReason, Outgoing, Pipeline, Qos};
use busbridge_proto::encode_payload;
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::BrokerConfig;

/// Publish access to the MQTT broker.
///
/// One client is shared by every bridge of the agent.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish one message.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Unavailable`] when the session is down, or the
    /// client error otherwise.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), PublishError>;

    /// Whether the broker session is connected.
    fn is_connected(&self) -> bool;

    /// Whether publishing is enabled at all.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Broker address parsed from a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Host name or IP
    pub host: String,
    /// TCP port
    pub port: u16,
    /// URL scheme asked for TLS
    pub tls: bool,
}

/// `rumqttc` session driven by a background event loop task.
pub struct MqttBroker {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttBroker {
    /// Create the client and start driving its event loop.
    ///
    /// The connection is established in the background; until the broker
    /// acknowledges it, [`BrokerClient::is_connected`] reports `false`.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL cannot be parsed.
    pub fn start(
        config: &BrokerConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, PublishError> {
        let address = parse_mqtt_url(&config.url)?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, &address.host, address.port);
        mqtt_options.set_keep_alive(config.keep_alive);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }
        if config.use_tls || address.tls {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let connected = Arc::new(AtomicBool::new(false));

        tracing::info!(
            host = %address.host,
            port = address.port,
            tls = config.use_tls || address.tls,
            "Connecting to MQTT broker"
        );
        tokio::spawn(drive_eventloop(eventloop, Arc::clone(&connected), cancel));

        Ok(Arc::new(Self { client, connected }))
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::Unavailable);
        }

        tracing::debug!(topic, payload_len = payload.len(), "Publishing");

        self.client
            .publish(topic, to_mqtt_qos(qos), false, payload)
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Stand-in broker used when MQTT publishing is switched off.
#[derive(Debug, Default)]
pub struct DisabledBroker;

#[async_trait]
impl BrokerClient for DisabledBroker {
    async fn publish(
        &self,
        _topic: &str,
        _payload: Vec<u8>,
        _qos: Qos,
    ) -> Result<(), PublishError> {
        Err(PublishError::Unavailable)
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Poll the event loop until cancelled. Polling again after an error makes
/// `rumqttc` reconnect, so errors only delay the next poll.
async fn drive_eventloop(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::default();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        connected.store(true, Ordering::SeqCst);
                        backoff.reset();
                        tracing::info!("MQTT broker connected");
                    } else {
                        tracing::warn!(code = ?ack.code, "MQTT broker refused connection");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    tracing::warn!("MQTT broker closed the session");
                }
                Ok(_) => {}
                Err(e) => {
                    if connected.swap(false, Ordering::SeqCst) {
                        tracing::warn!(error = %e, "MQTT connection lost");
                    } else {
                        tracing::debug!(error = %e, "MQTT connect failed");
                    }
                    let delay = backoff.next_delay();
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    tracing::debug!("MQTT event loop stopped");
}

/// Parse an MQTT URL into host, port and TLS flag.
///
/// Accepts `tcp://`, `mqtt://`, `ssl://` and `mqtts://` URLs as well as a
/// bare `host[:port]`.
///
/// # Errors
///
/// Returns [`PublishError::InvalidBrokerUrl`] for unknown schemes, a missing
/// host or an invalid port.
pub fn parse_mqtt_url(input: &str) -> Result<BrokerAddress, PublishError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| PublishError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            scheme => {
                return Err(PublishError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| PublishError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        return Ok(BrokerAddress {
            host: host.to_string(),
            port,
            tls,
        });
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| PublishError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            PublishError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(PublishError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls: false,
    })
}

/// Map a mapping QoS to the client's.
#[must_use]
pub fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Errors for broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Session not connected
    #[error("broker unavailable")]
    Unavailable,
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// No acknowledgement in time
    #[error("publish timed out")]
    Timeout,
}

/// Publisher worker settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// How long queued values are still published after cancellation
    pub drain_deadline: Duration,
    /// Timeout for a single publish
    pub publish_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            drain_deadline: Duration::from_secs(2),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Publish queued values until `cancel` fires, then drain what is left.
///
/// A publish in flight when `cancel` fires, and values still queued when the
/// drain deadline passes, are counted as dropped.
pub async fn run_publisher(
    pipeline: Arc<Pipeline>,
    broker: Arc<dyn BrokerClient>,
    config: PublisherConfig,
    cancel: CancellationToken,
) {
    let deadline = loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break Instant::now() + config.drain_deadline,
            item = pipeline.queue().pop() => match item {
                Some(item) => item,
                None => return,
            },
        };

        let fallback = item.clone();
        let attempt = publish_one(&pipeline, broker.as_ref(), config.publish_timeout, item);
        tokio::pin!(attempt);
        tokio::select! {
            () = &mut attempt => {}
            () = cancel.cancelled() => {
                // the in-flight publish only gets the drain deadline
                let deadline = Instant::now() + config.drain_deadline;
                if time::timeout_at(deadline, attempt).await.is_err() {
                    tracing::debug!(
                        mapping_id = %fallback.mapping_id,
                        "In-flight publish abandoned"
                    );
                    pipeline.record_dropped(&fallback, &DropReason::Shutdown);
                }
                break deadline;
            }
        }
    };

    let mut drained = 0usize;
    let mut dropped = 0usize;
    while let Some(item) = pipeline.queue().try_pop() {
        if Instant::now() >= deadline {
            pipeline.record_dropped(&item, &DropReason::Shutdown);
            dropped += 1;
            continue;
        }
        let fallback = item.clone();
        let attempt = publish_one(&pipeline, broker.as_ref(), config.publish_timeout, item);
        if time::timeout_at(deadline, attempt).await.is_err() {
            pipeline.record_dropped(&fallback, &DropReason::Shutdown);
            dropped += 1;
        } else {
            drained += 1;
        }
    }

    tracing::debug!(drained, dropped, "Publisher stopped");
}

async fn publish_one(
    pipeline: &Pipeline,
    broker: &dyn BrokerClient,
    publish_timeout: Duration,
    item: Outgoing,
) {
    if !pipeline.admit(&item, Instant::now()) {
        return;
    }

    if !broker.is_connected() {
        tracing::debug!(
            mapping_id = %item.mapping_id,
            topic = %item.topic,
            "Broker unavailable, reading dropped"
        );
        pipeline.record_dropped(&item, &DropReason::BrokerUnavailable);
        return;
    }

    let payload = match encode_payload(&item) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(mapping_id = %item.mapping_id, error = %e, "Cannot encode payload");
            pipeline.record_dropped(&item, &DropReason::PublishFailed(e.to_string()));
            return;
        }
    };

    match time::timeout(publish_timeout, broker.publish(&item.topic, payload, item.qos)).await {
        Ok(Ok(())) => {
            tracing::debug!(
                mapping_id = %item.mapping_id,
                topic = %item.topic,
                seq = item.seq,
                "Published"
            );
            pipeline.record_published(&item, Utc::now());
        }
        Ok(Err(PublishError::Unavailable)) => {
            tracing::debug!(mapping_id = %item.mapping_id, "Broker went away, reading dropped");
            pipeline.record_dropped(&item, &DropReason::BrokerUnavailable);
        }
        Ok(Err(e)) => {
            tracing::warn!(mapping_id = %item.mapping_id, error = %e, "Publish failed");
            pipeline.record_dropped(&item, &DropReason::PublishFailed(e.to_string()));
        }
        Err(_) => {
            tracing::warn!(
                mapping_id = %item.mapping_id,
                timeout_ms = publish_timeout.as_millis(),
                "Publish timed out"
            );
            pipeline.record_dropped(
                &item,
                &DropReason::PublishFailed(PublishError::Timeout.to_string()),
            );
        }
    }
}
