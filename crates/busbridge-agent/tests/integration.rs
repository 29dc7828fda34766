use busbridge_adapter_can::{CanHub, CanListener, DispatcherConfig};
use busbridge_agent::config::{AgentConfig, EngineConfig};
use busbridge_agent::publisher::parse_mqtt_url;
use busbridge_agent::{
    BridgeController, BrokerClient, MappingStore, MqttBroker, SourceBinding, SqliteStore,
};
use busbridge_core::{BusKind, CanFrame, Mapping};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn can_frame_reaches_live_broker() {
    if std::env::var("BUSBRIDGE_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set BUSBRIDGE_INTEGRATION=1 to run");
        return;
    }

    let mut config = AgentConfig::default();
    if let Ok(url) = std::env::var("BUSBRIDGE_MQTT_BROKER") {
        config.broker.url = url;
    }
    config.broker.client_id = format!("busbridge-{}", Uuid::new_v4());
    let address = parse_mqtt_url(&config.broker.url).unwrap();

    let topic = format!("busbridge/integration/{}", Uuid::new_v4());

    let mut sub_opts =
        MqttOptions::new(format!("sub-{}", Uuid::new_v4()), address.host, address.port);
    sub_opts.set_keep_alive(Duration::from_secs(5));
    let (sub_client, mut sub_eventloop) = AsyncClient::new(sub_opts, 10);
    sub_client.subscribe(&topic, QoS::AtLeastOnce).await.unwrap();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            match sub_eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = tx.send(publish.payload.to_vec());
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let cancel = CancellationToken::new();
    let broker = MqttBroker::start(&config.broker, cancel.clone()).unwrap();
    timeout(Duration::from_secs(5), async {
        while !broker.is_connected() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("timeout waiting for broker connection");

    let hub = Arc::new(CanHub::new(64));
    hub.set_up(true);
    let store = Arc::new(
        MappingStore::open(BusKind::Can, Arc::new(SqliteStore::in_memory().unwrap())).unwrap(),
    );
    store.create(Mapping::can(0x0F6, false, topic.clone())).unwrap();

    let bridge = BridgeController::new(
        "can",
        store,
        broker as Arc<dyn BrokerClient>,
        SourceBinding::Event {
            listener: Arc::clone(&hub) as Arc<dyn CanListener>,
            config: DispatcherConfig::default(),
        },
        EngineConfig::default(),
    )
    .unwrap();
    bridge.start().await.unwrap();

    // let the subscription settle before publishing
    tokio::time::sleep(Duration::from_millis(200)).await;
    hub.publish(CanFrame::new(0x0F6, false, vec![0x01, 0x02]));

    let received = timeout(Duration::from_secs(5), rx)
        .await
        .expect("timeout waiting for MQTT message")
        .expect("subscriber dropped");

    let body: serde_json::Value = serde_json::from_slice(&received).unwrap();
    assert_eq!(body["can_id"], "0x0F6");
    assert_eq!(body["data"], "0102");
    assert_eq!(body["dlc"], 2);

    bridge.stop().await;
    cancel.cancel();
}
