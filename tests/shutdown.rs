//! Shutdown ordering against a broker that acknowledges slowly.

mod common;

use carbridge::bridge::{BridgeEngine, EngineState, Supervisor};
use carbridge::model::{ElementSeed, MemoryModel, ValueKind};
use carbridge::mqtt::{BrokerClient, ConnectionState, MqttConfig, MqttHandler, QoS};
use common::broker::{BrokerEvent, SlowAckBroker};
use common::{settings, VIN};
use rumqttc::LastWill;
use std::sync::Arc;
use std::time::Duration;

fn busy_vehicle(elements: usize) -> MemoryModel {
    let seeds = (0..elements)
        .map(|i| {
            ElementSeed::attribute(format!("{}/sensors/s{}", VIN, i), ValueKind::Float)
                .with_initial("1.0")
        })
        .collect();
    MemoryModel::from_seeds(seeds).unwrap()
}

#[tokio::test]
async fn test_final_status_reaches_broker_behind_a_backlog() {
    let broker = SlowAckBroker::start(Duration::from_millis(300))
        .await
        .unwrap();
    let mut config = MqttConfig::new("127.0.0.1", "carbridge-shutdown-test");
    config.port = broker.port;

    let status_topic = "carconnectivity/0/plugins/mqtt/connection_state";
    let will = LastWill::new(status_topic, "DISCONNECTED", QoS::AtLeastOnce, true);
    let handler = Arc::new(MqttHandler::new(&config, will).unwrap());
    let client: Arc<dyn BrokerClient> = handler.clone();
    let engine = BridgeEngine::new(Arc::new(busy_vehicle(400)), client, settings());
    assert_eq!(engine.namer().status_topic(), status_topic);

    let running = Supervisor::create(engine.clone(), handler.clone())
        .with_disconnect_wait(Duration::from_secs(10))
        .start()
        .unwrap();
    for _ in 0..500 {
        if engine.state() == EngineState::Active {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.state(), EngineState::Active);

    let stopped = running.shutdown().await;
    assert_eq!(
        stopped.engine().connection_state(),
        ConnectionState::Disconnected
    );

    let events = broker.events();
    let status = events
        .iter()
        .position(|event| {
            *event
                == BrokerEvent::Publish {
                    topic: status_topic.to_string(),
                    payload: b"DISCONNECTED".to_vec(),
                }
        })
        .expect("DISCONNECTED status published");
    let disconnect = events
        .iter()
        .position(|event| *event == BrokerEvent::Disconnect)
        .expect("DISCONNECT sent");
    assert!(status < disconnect);
    assert_eq!(
        broker.payloads(status_topic).last().map(String::as_str),
        Some("DISCONNECTED")
    );
}
