//! Shared fixtures for the bridge integration tests.

#![allow(dead_code)]

pub mod broker;

use carbridge::bridge::{BridgeEngine, BridgeSettings};
use carbridge::model::{ElementSeed, MemoryModel, ValueKind};
use carbridge::mqtt::{BrokerClient, BrokerError, ConnectOutcome, MQTTMessage, QoS};
use carbridge::mqtt::BrokerCallbacks;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const PREFIX: &str = "carconnectivity/0";
pub const VIN: &str = "/garage/WVW1";

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Published {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Broker double that records every request instead of sending it.
#[derive(Default)]
pub struct RecordingBroker {
    published: Mutex<Vec<Published>>,
    subscribed: Mutex<Vec<(String, QoS)>>,
}

impl RecordingBroker {
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn last_payload(&self, topic: &str) -> Option<String> {
        self.published_to(topic).last().map(Published::text)
    }

    pub fn subscribed(&self) -> Vec<(String, QoS)> {
        self.subscribed.lock().clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
        self.subscribed.lock().clear();
    }
}

impl BrokerClient for RecordingBroker {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.published.lock().push(Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.subscribed.lock().push((topic.to_string(), qos));
        Ok(())
    }
}

pub fn topic(path: &str) -> String {
    format!("{}{}{}", PREFIX, VIN, path)
}

pub fn plugin_topic(rest: &str) -> String {
    format!("{}/plugins/mqtt/{}", PREFIX, rest)
}

/// Settings with the debounce disabled.
pub fn settings() -> BridgeSettings {
    BridgeSettings {
        ignore_for: Duration::ZERO,
        ..BridgeSettings::default()
    }
}

/// A small vehicle: a read-only odometer, a writable target temperature, a
/// writable climatization state and a start/stop command.
pub fn vehicle() -> MemoryModel {
    MemoryModel::from_seeds(vec![
        ElementSeed::attribute(format!("{}/odometer", VIN), ValueKind::Float)
            .with_unit("km", &["km", "mi"])
            .with_initial("12345.0"),
        ElementSeed::attribute(
            format!("{}/climatization/target_temperature", VIN),
            ValueKind::Float,
        )
        .writable()
        .with_unit("°C", &["°C", "°F", "K"])
        .with_range(-50.0, 400.0)
        .with_initial("21.5"),
        ElementSeed::attribute(format!("{}/climatization/state", VIN), ValueKind::Enum)
            .writable()
            .with_members(&["off", "heating", "cooling", "ventilation"])
            .with_initial("off"),
        ElementSeed::command(format!("{}/climatization/commands/start-stop", VIN))
            .with_members(&["start", "stop"]),
    ])
    .expect("vehicle seeds are valid")
}

pub struct Harness {
    pub model: Arc<MemoryModel>,
    pub broker: Arc<RecordingBroker>,
    pub engine: Arc<BridgeEngine>,
}

impl Harness {
    pub fn new(settings: BridgeSettings) -> Self {
        Self::with_model(vehicle(), settings)
    }

    pub fn with_model(model: MemoryModel, settings: BridgeSettings) -> Self {
        let model = Arc::new(model);
        let broker = Arc::new(RecordingBroker::default());
        let engine = BridgeEngine::new(model.clone(), broker.clone(), settings);
        Harness {
            model,
            broker,
            engine,
        }
    }

    pub fn connect(&self) {
        self.engine.on_connecting();
        self.engine.on_connect(ConnectOutcome::Accepted {
            session_present: false,
        });
    }

    pub fn receive(&self, topic: &str, payload: &str) {
        self.engine
            .on_message(MQTTMessage::from_topic(topic, payload.as_bytes().to_vec()));
    }
}
