//! Inbound message routing: broker writes become model mutations.
//!
//! ```text
//! message ─► debounce? ─► empty? ─► force update? ─► prefix? ─┬─► <path>_writetopic ─► set / invoke
//!                                                             ├─► <path>            ─► MESSAGE_NOT_UNDERSTOOD
//!                                                             └─► elsewhere         ─► ATTRIBUTE_NOT_CHANGEABLE
//! ```

use rumqttc::QoS;
use tracing::{debug, error, info};

use super::codec::{CodecError, ValueCodec};
use super::engine::BridgeEngine;
use super::error::BridgeErrorCode;
use super::topics::{InboundAddress, TopicFormat};
use crate::model::{CommandArg, Element, ElementKind, SetError, Unit, Value};
use crate::mqtt::MQTTMessage;

impl BridgeEngine {
    pub(crate) fn route_message(&self, message: &MQTTMessage) {
        debug!("Received {} (retained: {})", message, message.is_retained());
        if self.within_debounce() {
            info!(
                "Ignoring message from broker as it is within \"ignore_for\" delta of {}s",
                self.ignore_for().as_secs()
            );
            return;
        }
        if message.payload().is_empty() {
            debug!("Ignoring empty message on {}", message.topic());
            return;
        }

        let topic = message.topic();
        if topic == self.namer().force_update_write_topic() {
            self.force_update(message);
            return;
        }

        match self.namer().resolve(topic) {
            InboundAddress::Foreign => {
                // With external message consumers the subscription scope is unknown.
                if self.observers().message.is_empty() {
                    let text = format!(
                        "I don't understand message {}: {}",
                        topic,
                        message.payload_text()
                    );
                    error!("{}", text);
                    self.set_error(BridgeErrorCode::AttributeNotChangeable, &text);
                }
            }
            InboundAddress::Write(path) => self.write_element(&path, message),
            InboundAddress::Read(path) => {
                let writable = self
                    .model()
                    .get_by_path(&path)
                    .is_some_and(|element| element.is_writable());
                let text = if writable {
                    format!(
                        "Trying to change item on not writeable topic {}: {}, please use {}_writetopic instead",
                        topic,
                        message.payload_text(),
                        topic
                    )
                } else {
                    format!(
                        "Trying to change item that is not a changeable attribute and not using _writetopic {}: {}",
                        topic,
                        message.payload_text()
                    )
                };
                error!("{}", text);
                self.set_error(BridgeErrorCode::MessageNotUnderstood, &text);
            }
        }
    }

    fn force_update(&self, message: &MQTTMessage) {
        if !message.payload_text().eq_ignore_ascii_case("true") {
            debug!("Ignoring force update request '{}'", message.payload_text());
            return;
        }
        let marker = self.namer().force_update_topic();
        info!("Force update requested");
        self.publish(&marker, b"true".to_vec(), QoS::ExactlyOnce, false);
        if let Err(e) = self.model().refresh_all() {
            let text = format!("Error during force update: {}", e);
            error!("{}", text);
            self.set_error(BridgeErrorCode::SetError, &text);
        }
        self.publish(&marker, b"false".to_vec(), QoS::ExactlyOnce, false);
    }

    fn write_element(&self, path: &str, message: &MQTTMessage) {
        let Some(element) = self
            .model()
            .get_by_path(path)
            .filter(|element| element.is_writable())
        else {
            let text = format!(
                "Trying to change item that is not a changeable attribute {}: {}",
                message.topic(),
                message.payload_text()
            );
            error!("{}", text);
            self.set_error(BridgeErrorCode::MessageNotUnderstood, &text);
            return;
        };

        let json = self.namer().format() == TopicFormat::Json;
        let payload = message.payload();
        let (action, result) = match element.kind() {
            ElementKind::Command => ("executing command", execute_command(element.as_ref(), payload, json)),
            ElementKind::Attribute => ("setting value", set_attribute(element.as_ref(), payload, json)),
        };

        match result {
            Ok(()) => {
                debug!("Successfully finished {} on {}", action, path);
                self.set_error(BridgeErrorCode::Success, "");
            }
            Err(e) => {
                let text = format!("Error {}: {}", action, e);
                info!("{}", text);
                self.set_error(BridgeErrorCode::from(&e), &text);
            }
        }
    }
}

fn format_error(err: CodecError) -> SetError {
    SetError::Format(err.to_string())
}

fn execute_command(element: &dyn Element, payload: &[u8], json: bool) -> Result<(), SetError> {
    if json {
        let object = ValueCodec::decode_object(payload).map_err(|e| match e {
            CodecError::NotAnObject => {
                SetError::Format("JSON message is not a dictionary or string".to_string())
            }
            other => format_error(other),
        })?;
        element.invoke(CommandArg::Object(object))
    } else {
        let text = ValueCodec::decode_text(payload).map_err(format_error)?;
        element.invoke(CommandArg::Text(text))
    }
}

fn set_attribute(element: &dyn Element, payload: &[u8], json: bool) -> Result<(), SetError> {
    if !json {
        let text = ValueCodec::decode_text(payload).map_err(format_error)?;
        return element.set_value(Value::Str(text), None);
    }

    let object = ValueCodec::decode_object(payload).map_err(|e| match e {
        CodecError::NotAnObject => SetError::Format(
            "JSON message is not a dictionary containing \"val\" key and optional \"uni\" key"
                .to_string(),
        ),
        other => format_error(other),
    })?;
    let raw = object.get("val").ok_or_else(|| {
        SetError::Format("JSON message does not contain \"val\" key".to_string())
    })?;
    let value = ValueCodec::decode_json_value(raw).map_err(format_error)?;

    let unit = match object.get("uni") {
        None => None,
        Some(uni) => {
            let legal = element.legal_units();
            match uni.as_str().map(Unit::new) {
                Some(unit) if legal.contains(&unit) => Some(unit),
                _ => {
                    let names: Vec<&str> = legal.iter().map(Unit::code).collect();
                    return Err(SetError::Format(format!(
                        "JSON message contains invalid \"uni\" key: {} not in [{}]",
                        uni,
                        names.join(", ")
                    )));
                }
            }
        }
    };
    element.set_value(value, unit)
}
