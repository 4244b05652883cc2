//! Time-dependent behaviour, driven with a paused tokio clock.

mod common;

use carbridge::bridge::supervisor::run_flush_loop;
use carbridge::bridge::BridgeSettings;
use carbridge::model::{Element, Model, Value};
use carbridge::mqtt::{BrokerCallbacks, QoS, SubscribeAck};
use common::{plugin_topic, settings, topic, Harness, VIN};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn target_temperature(harness: &Harness) -> Value {
    harness
        .model
        .get_by_path(&format!("{}/climatization/target_temperature", VIN))
        .map(|e| e.value())
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn test_messages_ignored_right_after_subscribe() {
    let harness = Harness::new(BridgeSettings {
        ignore_for: Duration::from_secs(5),
        ..settings()
    });
    harness.connect();
    harness.engine.on_subscribe(SubscribeAck {
        pkid: 1,
        granted: vec![Some(QoS::AtLeastOnce)],
    });

    let write_topic = format!("{}_writetopic", topic("/climatization/target_temperature"));
    harness.receive(&write_topic, "25");
    assert_eq!(target_temperature(&harness), Value::Float(21.5));

    tokio::time::advance(Duration::from_secs(6)).await;
    harness.receive(&write_topic, "25");
    assert_eq!(target_temperature(&harness), Value::Float(25.0));
}

#[tokio::test(start_paused = true)]
async fn test_refused_subscribe_does_not_arm_debounce() {
    let harness = Harness::new(BridgeSettings {
        ignore_for: Duration::from_secs(5),
        ..settings()
    });
    harness.connect();
    harness.engine.on_subscribe(SubscribeAck {
        pkid: 7,
        granted: vec![None],
    });

    let write_topic = format!("{}_writetopic", topic("/climatization/target_temperature"));
    harness.receive(&write_topic, "19");
    assert_eq!(target_temperature(&harness), Value::Float(19.0));
}

#[tokio::test(start_paused = true)]
async fn test_flush_loop_publishes_catalog_periodically() {
    let harness = Harness::new(settings());
    let cancel = CancellationToken::new();
    let flush = tokio::spawn(run_flush_loop(
        harness.engine.clone(),
        Duration::from_secs(10),
        cancel.clone(),
    ));

    harness.connect();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(harness
        .broker
        .published_to(&plugin_topic("topics"))
        .is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(harness.broker.published_to(&plugin_topic("topics")).len(), 1);
    assert_eq!(
        harness
            .broker
            .published_to(&plugin_topic("writeable_topics"))
            .len(),
        1
    );

    // Nothing changed, nothing republished.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.broker.published_to(&plugin_topic("topics")).len(), 1);

    cancel.cancel();
    flush.await.unwrap();
}
