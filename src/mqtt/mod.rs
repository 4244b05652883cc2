//! # MQTT Integration Module
//!
//! Everything that touches the broker lives here. The bridge logic never sees
//! rumqttc directly; it talks to a [`BrokerClient`] for outgoing traffic and is
//! driven through [`BrokerCallbacks`] for incoming traffic.
//!
//! ## Why This Module Exists
//!
//! The rumqttc event loop is a single future that must be polled continuously:
//! it performs the connect, delivers acknowledgements and incoming publishes,
//! and reconnects after failures. The bridge, on the other hand, wants plain
//! synchronous entry points it can call from model-update threads. This module
//! sits in between:
//! - Outgoing publish/subscribe requests are queued and forwarded by a task,
//!   so callers never block on the network
//! - The network loop turns rumqttc events into callback invocations
//! - Connection refusals and drops are logged and retried every 10 seconds
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker address, credentials, TLS, keepalive
//! ├── message_manager.rs  - Inbound message type and outgoing request queue
//! └── mqtt_handler.rs     - rumqttc client, network loop, connection state
//! ```
//!
//! ## Data Flow
//!
//! ```text
//!  BridgeEngine ──publish/subscribe──► outbound queue ──► forwarder ──► AsyncClient
//!       ▲                                                                   │
//!       └──── on_connect / on_disconnect / on_subscribe / on_message ◄── EventLoop::poll
//! ```

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::{MqttConfig, TlsConfig};
pub use message_manager::MQTTMessage;
pub use mqtt_handler::{ConnectionState, MqttHandler};
pub use rumqttc::QoS;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Outgoing request queue is closed")]
    QueueClosed,

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Broker client already started")]
    AlreadyStarted,
}

/// Outgoing side of a broker connection.
///
/// Both calls only enqueue work; delivery happens asynchronously.
pub trait BrokerClient: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
        -> Result<(), BrokerError>;

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError>;
}

/// Result of a connection attempt as reported by the network loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accepted { session_present: bool },
    /// The broker answered with a non-success return code.
    Refused(String),
    /// No broker answer at all (DNS, TCP, TLS, timeout).
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We sent DISCONNECT ourselves.
    Requested,
    /// The broker closed the session.
    ServerInitiated,
    /// The transport failed.
    ConnectionLost(String),
}

/// Acknowledgement of one subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    pub pkid: u16,
    /// Granted QoS per requested filter; `None` for a refused filter.
    pub granted: Vec<Option<QoS>>,
}

impl SubscribeAck {
    pub fn any_granted(&self) -> bool {
        self.granted.iter().any(Option::is_some)
    }
}

/// Incoming side of a broker connection.
pub trait BrokerCallbacks: Send + Sync {
    /// A new connection attempt is about to start.
    fn on_connecting(&self) {}
    fn on_connect(&self, outcome: ConnectOutcome);
    fn on_disconnect(&self, reason: DisconnectReason);
    fn on_subscribe(&self, ack: SubscribeAck);
    fn on_message(&self, message: MQTTMessage);
}
