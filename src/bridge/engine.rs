//! Bridge engine: the model-to-broker relay.
//!
//! # State Machine
//!
//! ```text
//!          connect accepted          replay done
//!   Idle ───────────────────► Subscribing ───────────► Active
//!    ▲                             │                     │
//!    └────────── disconnect ───────┴─────────────────────┘
//! ```
//!
//! The engine registers with the model once, at construction. Model events
//! arriving while `Idle` are dropped; the replay on the next connect
//! republishes everything anyway.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use rumqttc::QoS;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::catalog::{join_topics, TopicCatalog};
use super::codec::{CodecOptions, ValueCodec};
use super::error::BridgeErrorCode;
use super::observers::BridgeObservers;
use super::topics::{TopicFormat, TopicNamer};
use crate::model::{ChangeEvent, Element, Model, ModelObserver, ObserverId, Value};
use crate::mqtt::{
    BrokerCallbacks, BrokerClient, ConnectOutcome, ConnectionState, DisconnectReason,
    MQTTMessage, SubscribeAck,
};

pub const DEFAULT_PREFIX: &str = "carconnectivity/0";
pub const DEFAULT_PLUGIN_ID: &str = "mqtt";

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub plugin_id: String,
    pub prefix: String,
    pub topic_format: TopicFormat,
    pub topic_filter: Option<Regex>,
    /// Also publish on refreshes that did not change the value.
    pub republish_on_update: bool,
    /// Keep retained values of disabled elements.
    pub retain_on_disconnect: bool,
    /// Debounce window after a subscribe acknowledgement. Zero disables it.
    pub ignore_for: Duration,
    pub with_full_json: bool,
    pub codec: CodecOptions,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            plugin_id: DEFAULT_PLUGIN_ID.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            topic_format: TopicFormat::Simple,
            topic_filter: None,
            republish_on_update: false,
            retain_on_disconnect: false,
            ignore_for: Duration::from_secs(5),
            with_full_json: false,
            codec: CodecOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineState {
    #[default]
    Idle,
    Subscribing,
    Active,
}

pub struct BridgeEngine {
    model: Arc<dyn Model>,
    broker: Arc<dyn BrokerClient>,
    codec: ValueCodec,
    namer: TopicNamer,
    catalog: TopicCatalog,
    republish_on_update: bool,
    retain_on_disconnect: bool,
    ignore_for: Duration,
    with_full_json: bool,
    state: Mutex<EngineState>,
    has_error: Mutex<Option<bool>>,
    last_subscribe: Mutex<Option<Instant>>,
    connection: Mutex<ConnectionState>,
    model_observer: Mutex<Option<ObserverId>>,
    observers: BridgeObservers,
}

impl BridgeEngine {
    pub fn new(
        model: Arc<dyn Model>,
        broker: Arc<dyn BrokerClient>,
        settings: BridgeSettings,
    ) -> Arc<Self> {
        let codec = ValueCodec::new(settings.codec.clone());
        Self::with_codec(model, broker, settings, codec)
    }

    /// Like [`BridgeEngine::new`] but with a caller-provided codec.
    pub fn with_codec(
        model: Arc<dyn Model>,
        broker: Arc<dyn BrokerClient>,
        settings: BridgeSettings,
        codec: ValueCodec,
    ) -> Arc<Self> {
        let namer = TopicNamer::new(
            settings.prefix,
            settings.plugin_id,
            settings.topic_format,
            settings.topic_filter,
        );
        let catalog = TopicCatalog::new(namer.topics_topic(), namer.writeable_topics_topic());

        let engine = Arc::new(BridgeEngine {
            model: model.clone(),
            broker,
            codec,
            namer,
            catalog,
            republish_on_update: settings.republish_on_update,
            retain_on_disconnect: settings.retain_on_disconnect,
            ignore_for: settings.ignore_for,
            with_full_json: settings.with_full_json,
            state: Mutex::new(EngineState::Idle),
            has_error: Mutex::new(None),
            last_subscribe: Mutex::new(None),
            connection: Mutex::new(ConnectionState::Disconnected),
            model_observer: Mutex::new(None),
            observers: BridgeObservers::default(),
        });

        let mut events = vec![
            ChangeEvent::Enabled,
            ChangeEvent::Disabled,
            ChangeEvent::ValueChanged,
        ];
        if engine.republish_on_update {
            events.push(ChangeEvent::Updated);
        }
        let id = model.subscribe_to_changes(engine.clone(), &events);
        *engine.model_observer.lock() = Some(id);
        engine
    }

    /// Drops the model registration. The engine ignores the model afterwards.
    pub fn detach(&self) {
        if let Some(id) = self.model_observer.lock().take() {
            self.model.unsubscribe(id);
            debug!("Bridge engine detached from model");
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.lock()
    }

    /// `None` until the first error report.
    pub fn has_error(&self) -> Option<bool> {
        *self.has_error.lock()
    }

    pub fn catalog(&self) -> &TopicCatalog {
        &self.catalog
    }

    pub fn namer(&self) -> &TopicNamer {
        &self.namer
    }

    pub fn observers(&self) -> &BridgeObservers {
        &self.observers
    }

    pub(crate) fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    pub(crate) fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) {
        debug!("Publishing {} bytes to {}", payload.len(), topic);
        if let Err(e) = self.broker.publish(topic, payload, qos, retain) {
            error!("Could not publish to {}: {}", topic, e);
        }
    }

    fn subscribe(&self, topic: &str, qos: QoS) {
        debug!("Subscribing to {}", topic);
        if let Err(e) = self.broker.subscribe(topic, qos) {
            error!("Could not subscribe to {}: {}", topic, e);
        }
    }

    /// Adds `topic` to the read set unless it is filtered.
    fn announce(&self, topic: &str) {
        if !self.namer.is_filtered(topic) {
            self.catalog.add(topic, false);
        }
    }

    fn is_status_element(&self, element: &dyn Element) -> bool {
        element.path() == self.namer.status_path()
    }

    /// Subscribes and catalogs the topics of a newly visible element.
    fn register_element(&self, element: &dyn Element) {
        let topics = self.namer.topics_for(element.path(), element.is_writable());
        if let Some(write) = &topics.write {
            self.subscribe(write, QoS::AtLeastOnce);
            self.catalog.add(write, true);
        }
        if let Some(read) = &topics.read {
            self.catalog.add(read, false);
        }
    }

    /// Publishes the current value of an enabled element, retained at QoS 1.
    pub fn publish_element(&self, element: &dyn Element) {
        if !element.enabled() {
            warn!("Not publishing disabled element {}", element.path());
            return;
        }
        let Some(topic) = self.namer.topics_for(element.path(), false).read else {
            return;
        };
        let (value, unit) = element.localized(self.codec.locale());
        let value = round_to_precision(value, element.precision());
        let encoded = self.codec.encode(&value);
        debug!("{}, value changed: new value is: {}", topic, encoded);

        let payload = match self.namer.format() {
            TopicFormat::Simple => encoded.into_bytes(),
            TopicFormat::Json => {
                let mut envelope = serde_json::Map::new();
                envelope.insert("val".to_string(), encoded.to_json());
                if let Some(updated) = element.last_updated() {
                    envelope.insert(
                        "upd".to_string(),
                        serde_json::Value::String(self.codec.format_timestamp(&updated)),
                    );
                }
                if let Some(unit) = unit {
                    envelope.insert(
                        "uni".to_string(),
                        serde_json::Value::String(unit.code().to_string()),
                    );
                }
                match serde_json::to_vec(&serde_json::Value::Object(envelope)) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Could not serialize envelope for {}: {}", topic, e);
                        return;
                    }
                }
            }
        };
        self.publish(&topic, payload, QoS::AtLeastOnce, true);
    }

    fn retract_element(&self, element: &dyn Element) {
        if self.retain_on_disconnect {
            return;
        }
        if let Some(topic) = self.namer.topics_for(element.path(), false).read {
            debug!("{}, value is disabled", topic);
            self.publish(&topic, Vec::new(), QoS::AtLeastOnce, true);
        }
    }

    /// Reconnect replay. Runs while `Subscribing`.
    fn replay(&self) {
        let force_update = self.namer.force_update_write_topic();
        if !self.namer.is_filtered(&force_update) {
            self.subscribe(&force_update, QoS::ExactlyOnce);
            self.catalog.add(&force_update, true);
        }
        self.announce(&self.namer.force_update_topic());

        for topic in self.catalog.writable_topics() {
            if topic != force_update {
                self.subscribe(&topic, QoS::AtLeastOnce);
            }
        }

        let mut published = 0usize;
        for element in self.model.get_all_elements() {
            if !element.enabled() || self.is_status_element(element.as_ref()) {
                continue;
            }
            if self.namer.is_filtered(&self.namer.base_topic(element.path())) {
                continue;
            }
            self.register_element(element.as_ref());
            if !element.value().is_none() {
                self.publish_element(element.as_ref());
                published += 1;
            }
        }

        if self.with_full_json {
            let topic = self.namer.full_json_topic();
            self.announce(&topic);
            match serde_json::to_vec_pretty(&self.model.snapshot_json()) {
                Ok(payload) => self.publish(&topic, payload, QoS::AtLeastOnce, true),
                Err(e) => error!("Could not serialize full JSON snapshot: {}", e),
            }
        }
        info!("Replay finished, {} values published", published);
    }

    /// Publishes the connection state and mirrors it into the model.
    /// Repeating the current state is a no-op.
    pub fn set_connection_state(&self, state: ConnectionState) {
        if let Some((topic, payload)) = self.record_connection_state(state) {
            self.publish(&topic, payload, QoS::AtLeastOnce, true);
        }
    }

    /// Like [`BridgeEngine::set_connection_state`] but hands the status
    /// topic and payload back instead of publishing them. `None` when the
    /// state did not change.
    pub fn record_connection_state(&self, state: ConnectionState) -> Option<(String, Vec<u8>)> {
        if std::mem::replace(&mut *self.connection.lock(), state) == state {
            return None;
        }
        let topic = self.namer.status_topic();
        self.announce(&topic);
        self.model
            .set_status(&self.namer.status_path(), Value::Enum(state.as_str().to_string()));
        Some((topic, state.as_str().as_bytes().to_vec()))
    }

    /// Reports an outcome on the error topics.
    pub fn set_error(&self, code: BridgeErrorCode, message: &str) {
        let code_topic = self.namer.error_code_topic();
        let message_topic = self.namer.error_message_topic();
        let mut has_error = self.has_error.lock();

        if code.is_success() {
            if *has_error != Some(false) {
                self.publish(&code_topic, b"0".to_vec(), QoS::AtLeastOnce, true);
                self.publish(&message_topic, Vec::new(), QoS::AtLeastOnce, true);
            }
        } else if !message.is_empty() || *has_error != Some(false) {
            self.publish(
                &code_topic,
                code.as_i32().to_string().into_bytes(),
                QoS::AtLeastOnce,
                true,
            );
            self.announce(&code_topic);
            self.publish(
                &message_topic,
                message.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                true,
            );
            self.announce(&message_topic);
        }
        *has_error = Some(!code.is_success());
    }

    /// Publishes changed catalog sets. Only flushes while `Active`; changes
    /// stay pending otherwise.
    pub fn flush_catalog(&self) -> bool {
        if self.state() != EngineState::Active {
            return false;
        }
        let snapshot = self
            .catalog
            .snapshot_if_changed(|topic| !self.namer.is_filtered(topic));
        if let Some(topics) = &snapshot.writable_topics {
            self.publish(
                self.catalog.writeable_topics_topic(),
                join_topics(topics).into_bytes(),
                QoS::AtLeastOnce,
                true,
            );
        }
        if let Some(topics) = &snapshot.read_topics {
            self.publish(
                self.catalog.topics_topic(),
                join_topics(topics).into_bytes(),
                QoS::AtLeastOnce,
                true,
            );
        }
        !snapshot.is_empty()
    }

    pub(crate) fn within_debounce(&self) -> bool {
        if self.ignore_for.is_zero() {
            return false;
        }
        self.last_subscribe
            .lock()
            .is_some_and(|at| at.elapsed() < self.ignore_for)
    }

    pub(crate) fn ignore_for(&self) -> Duration {
        self.ignore_for
    }
}

impl ModelObserver for BridgeEngine {
    fn on_model_event(&self, element: &Arc<dyn Element>, event: ChangeEvent) {
        if self.state() == EngineState::Idle || self.is_status_element(element.as_ref()) {
            return;
        }
        match event {
            ChangeEvent::Enabled => self.register_element(element.as_ref()),
            ChangeEvent::Disabled => self.retract_element(element.as_ref()),
            ChangeEvent::ValueChanged => self.publish_element(element.as_ref()),
            ChangeEvent::Updated => {
                if self.republish_on_update {
                    self.publish_element(element.as_ref());
                }
            }
        }
    }
}

impl BrokerCallbacks for BridgeEngine {
    fn on_connecting(&self) {
        self.set_connection_state(ConnectionState::Connecting);
    }

    fn on_connect(&self, outcome: ConnectOutcome) {
        match &outcome {
            ConnectOutcome::Accepted { .. } => {
                info!("Connected to MQTT broker");
                *self.state.lock() = EngineState::Subscribing;
                self.set_connection_state(ConnectionState::Connected);
                self.replay();
                *self.state.lock() = EngineState::Active;
            }
            ConnectOutcome::Refused(reason) | ConnectOutcome::Unreachable(reason) => {
                debug!("Connect attempt failed: {}", reason);
                *self.state.lock() = EngineState::Idle;
                self.set_connection_state(ConnectionState::Error);
            }
        }
        self.observers.connect.emit(&outcome);
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        *self.state.lock() = EngineState::Idle;
        match &reason {
            DisconnectReason::Requested => info!("Client successfully disconnected"),
            DisconnectReason::ServerInitiated => info!("Client disconnected by the broker"),
            DisconnectReason::ConnectionLost(e) => {
                error!("Client unexpectedly disconnected ({}), trying to reconnect", e)
            }
        }
        self.set_connection_state(ConnectionState::Disconnected);
        self.observers.disconnect.emit(&reason);
    }

    fn on_subscribe(&self, ack: SubscribeAck) {
        if ack.any_granted() {
            *self.last_subscribe.lock() = Some(Instant::now());
            debug!("Successfully subscribed to topic of id {}", ack.pkid);
        } else {
            error!("Subscribe of id {} was not successful", ack.pkid);
        }
        self.observers.subscribe.emit(&ack);
    }

    fn on_message(&self, message: MQTTMessage) {
        self.route_message(&message);
        self.observers.message.emit(&message);
    }
}

/// Rounds floats to the decimal digits implied by `precision` (e.g. 0.1 → 1).
pub fn round_to_precision(value: Value, precision: Option<f64>) -> Value {
    let (Value::Float(v), Some(precision)) = (&value, precision) else {
        return value;
    };
    if precision.is_nan() || precision <= 0.0 || !v.is_finite() {
        return value;
    }
    let digits = (-precision.log10() - 1e-9).ceil().clamp(0.0, 15.0) as i32;
    let factor = 10f64.powi(digits);
    Value::Float((v * factor).round() / factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_precision() {
        assert_eq!(
            round_to_precision(Value::Float(21.456), Some(0.1)),
            Value::Float(21.5)
        );
        assert_eq!(
            round_to_precision(Value::Float(21.456), Some(0.01)),
            Value::Float(21.46)
        );
        assert_eq!(
            round_to_precision(Value::Float(21.6), Some(1.0)),
            Value::Float(22.0)
        );
        assert_eq!(
            round_to_precision(Value::Float(21.456), None),
            Value::Float(21.456)
        );
        assert_eq!(round_to_precision(Value::Int(3), Some(0.1)), Value::Int(3));
        assert_eq!(
            round_to_precision(Value::Float(1.0), Some(0.0)),
            Value::Float(1.0)
        );
    }

    #[test]
    fn test_default_settings() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.prefix, "carconnectivity/0");
        assert_eq!(settings.plugin_id, "mqtt");
        assert_eq!(settings.ignore_for, Duration::from_secs(5));
        assert_eq!(settings.topic_format, TopicFormat::Simple);
    }
}
