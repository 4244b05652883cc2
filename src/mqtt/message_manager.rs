use chrono::NaiveDateTime;
use rumqttc::QoS;
use std::borrow::Cow;
use std::fmt;

/// A publish received from the broker.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    topic: String,
    payload: Vec<u8>,
    retained: bool,
    timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.payload_text();
        let preview: String = text.chars().take(32).collect();
        write!(f, "{} - {}: {}", self.timestamp, self.topic, preview)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        MQTTMessage {
            topic: topic.into(),
            payload: payload.into(),
            retained: false,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn from_publish(publish: &rumqttc::Publish) -> Self {
        let mut message = Self::from_topic(publish.topic.clone(), publish.payload.to_vec());
        message.retained = publish.retain;
        message
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn is_retained(&self) -> bool {
        self.retained
    }
}

/// Work item for the forwarder task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        topic: String,
        qos: QoS,
    },
}

impl Outbound {
    pub fn topic(&self) -> &str {
        match self {
            Outbound::Publish { topic, .. } | Outbound::Subscribe { topic, .. } => topic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_previews_payload() {
        let message = MQTTMessage::from_topic("a/b", "x".repeat(100));
        let shown = message.to_string();
        assert!(shown.ends_with(&format!("a/b: {}", "x".repeat(32))));
    }

    #[test]
    fn test_lossy_text() {
        let message = MQTTMessage::from_topic("a", vec![b'o', 0xff, b'k']);
        assert_eq!(message.payload_text(), "o\u{fffd}k");
        assert!(!message.is_retained());
    }

    #[test]
    fn test_from_publish_keeps_retain_flag() {
        let mut publish = rumqttc::Publish::new("a/b", QoS::AtLeastOnce, "on");
        publish.retain = true;
        let message = MQTTMessage::from_publish(&publish);
        assert!(message.is_retained());
        assert_eq!(message.topic(), "a/b");
        assert_eq!(message.payload(), b"on");
    }
}
