use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, Outgoing, Packet,
    QoS, SubscribeReasonCode,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message_manager::{MQTTMessage, Outbound};
use super::{
    config, BrokerCallbacks, BrokerClient, BrokerError, ConnectOutcome, DisconnectReason,
    SubscribeAck,
};

pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Wire form used on the status topic and as last will.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human readable form of a CONNACK return code.
pub fn describe_connect_code(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "Success",
        ConnectReturnCode::RefusedProtocolVersion => "Unsupported protocol version",
        ConnectReturnCode::BadClientId => "Client identifier not valid",
        ConnectReturnCode::ServiceUnavailable => "Server unavailable",
        ConnectReturnCode::BadUserNamePassword => "Bad user name or password",
        ConnectReturnCode::NotAuthorized => "Not authorized",
    }
}

struct Pending {
    eventloop: EventLoop,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// Progress of the final status publish through the network loop.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
enum FinalPublish {
    #[default]
    Idle,
    /// Waiting for the UNSUBSCRIBE that precedes the publish.
    AwaitFence,
    AwaitPublish,
    AwaitAck(u16),
    Acked,
}

impl FinalPublish {
    fn on_unsubscribe(&mut self) -> bool {
        if *self != FinalPublish::AwaitFence {
            return false;
        }
        *self = FinalPublish::AwaitPublish;
        true
    }

    fn on_publish(&mut self, pkid: u16) -> bool {
        if *self != FinalPublish::AwaitPublish {
            return false;
        }
        *self = FinalPublish::AwaitAck(pkid);
        true
    }

    fn on_puback(&mut self, pkid: u16) -> bool {
        if *self != FinalPublish::AwaitAck(pkid) {
            return false;
        }
        *self = FinalPublish::Acked;
        true
    }
}

/// rumqttc-backed broker client.
///
/// `new` only prepares the session; nothing touches the network until
/// [`MqttHandler::start`] spawns the network loop and the request forwarder.
pub struct MqttHandler {
    client: AsyncClient,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<Option<Pending>>,
    connected: Arc<watch::Sender<bool>>,
    closing: Arc<AtomicBool>,
    gate: Arc<tokio::sync::Mutex<()>>,
    final_publish: Arc<watch::Sender<FinalPublish>>,
    address: String,
}

impl MqttHandler {
    pub fn new(config: &config::MqttConfig, last_will: LastWill) -> Result<Self, BrokerError> {
        let options = config.to_options(last_will)?;
        let (client, eventloop) = AsyncClient::new(options, 100);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        Ok(MqttHandler {
            client,
            outbound,
            pending: Mutex::new(Some(Pending {
                eventloop,
                outbound: outbound_rx,
            })),
            connected: Arc::new(watch::Sender::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            final_publish: Arc::new(watch::Sender::new(FinalPublish::Idle)),
            address: config.address(),
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Spawns the network loop and the forwarder. Can only be called once.
    pub fn start(
        &self,
        callbacks: Arc<dyn BrokerCallbacks>,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, BrokerError> {
        let Pending {
            eventloop,
            outbound,
        } = self.pending.lock().take().ok_or(BrokerError::AlreadyStarted)?;

        info!("Starting MQTT client for {}", self.address);
        let network = NetworkLoop {
            eventloop,
            callbacks,
            connected: self.connected.clone(),
            closing: self.closing.clone(),
            final_publish: self.final_publish.clone(),
            address: self.address.clone(),
            cancel: cancel.clone(),
        };
        let forwarder = Forwarder {
            client: self.client.clone(),
            requests: outbound,
            gate: self.gate.clone(),
            closing: self.closing.clone(),
            cancel,
        };
        Ok(vec![
            tokio::spawn(network.run()),
            tokio::spawn(forwarder.run()),
        ])
    }

    /// Closes the session. When connected, `status` (topic, payload) is
    /// published retained at QoS 1 and its PUBACK awaited before DISCONNECT
    /// goes out. Both waits are bounded by `wait`.
    ///
    /// Requests still queued for the forwarder are dropped.
    pub async fn disconnect(&self, status: Option<(String, Vec<u8>)>, wait: Duration) {
        self.closing.store(true, Ordering::SeqCst);
        if !self.is_connected() {
            debug!("Not connected, skipping final status and DISCONNECT");
            return;
        }
        if let Some((topic, payload)) = status {
            match tokio::time::timeout(wait, self.publish_final(topic, payload)).await {
                Ok(Ok(())) => debug!("Final status acknowledged"),
                Ok(Err(e)) => warn!("Failed to publish the final status: {}", e),
                Err(_) => warn!(
                    "No acknowledgement for the final status publish within {:?}",
                    wait
                ),
            }
        }
        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to send DISCONNECT: {}", e);
            return;
        }
        let mut connected = self.connected.subscribe();
        if tokio::time::timeout(wait, connected.wait_for(|up| !*up))
            .await
            .is_err()
        {
            warn!("Broker connection still open after {:?}", wait);
        }
    }

    /// Publishes straight to the client, bypassing the outbound queue, and
    /// waits for the PUBACK carrying this publish's packet id.
    async fn publish_final(&self, topic: String, payload: Vec<u8>) -> Result<(), BrokerError> {
        // The forwarder checks `closing` under this lock.
        let _gate = self.gate.lock().await;
        let mut progress = self.final_publish.subscribe();
        self.final_publish.send_replace(FinalPublish::AwaitFence);

        // Nothing else unsubscribes, so this UNSUBSCRIBE leaving the event
        // loop marks the end of the backlog ahead of the publish.
        self.client.unsubscribe(topic.clone()).await?;
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await?;
        progress
            .wait_for(|stage| *stage == FinalPublish::Acked)
            .await
            .map_err(|_| BrokerError::QueueClosed)?;
        Ok(())
    }
}

impl BrokerClient for MqttHandler {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.outbound
            .send(Outbound::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            })
            .map_err(|_| BrokerError::QueueClosed)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.outbound
            .send(Outbound::Subscribe {
                topic: topic.to_string(),
                qos,
            })
            .map_err(|_| BrokerError::QueueClosed)
    }
}

struct Forwarder {
    client: AsyncClient,
    requests: mpsc::UnboundedReceiver<Outbound>,
    gate: Arc<tokio::sync::Mutex<()>>,
    closing: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Forwarder {
    async fn run(mut self) {
        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let _gate = self.gate.lock().await;
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            let topic = request.topic().to_string();
            let client = &self.client;
            let send = async {
                match request {
                    Outbound::Publish {
                        topic,
                        payload,
                        qos,
                        retain,
                    } => client.publish(topic, qos, retain, payload).await,
                    Outbound::Subscribe { topic, qos } => client.subscribe(topic, qos).await,
                }
            };
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = send => result,
            };
            if let Err(e) = result {
                error!("Failed to hand request for {} to the MQTT client: {}", topic, e);
            }
        }
        debug!("MQTT forwarder stopped");
    }
}

struct NetworkLoop {
    eventloop: EventLoop,
    callbacks: Arc<dyn BrokerCallbacks>,
    connected: Arc<watch::Sender<bool>>,
    closing: Arc<AtomicBool>,
    final_publish: Arc<watch::Sender<FinalPublish>>,
    address: String,
    cancel: CancellationToken,
}

impl NetworkLoop {
    async fn run(mut self) {
        let mut attempting = false;
        loop {
            if !attempting && !*self.connected.borrow() {
                attempting = true;
                info!("Connecting to MQTT broker {}", self.address);
                self.callbacks.on_connecting();
            }

            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(packet)) => self.handle_incoming(packet),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.connected.send_replace(false);
                    info!("Client successfully disconnected from {}", self.address);
                    self.callbacks.on_disconnect(DisconnectReason::Requested);
                    break;
                }
                Ok(Event::Outgoing(Outgoing::Unsubscribe(_))) => {
                    self.final_publish.send_if_modified(FinalPublish::on_unsubscribe);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    self.final_publish
                        .send_if_modified(|stage| stage.on_publish(pkid));
                }
                Ok(Event::Outgoing(_)) => {}
                Err(e) if self.closing.load(Ordering::SeqCst) => {
                    self.connected.send_replace(false);
                    debug!("Network loop closing: {}", e);
                    break;
                }
                Err(e) => {
                    attempting = false;
                    self.handle_error(e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }
        self.connected.send_replace(false);
        info!("MQTT network loop stopped");
    }

    fn handle_incoming(&self, packet: Packet) {
        match packet {
            Packet::ConnAck(ack) => {
                self.connected.send_replace(true);
                info!("Connected to MQTT broker {}", self.address);
                self.callbacks.on_connect(ConnectOutcome::Accepted {
                    session_present: ack.session_present,
                });
            }
            Packet::SubAck(ack) => {
                let granted = ack
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => Some(*qos),
                        SubscribeReasonCode::Failure => None,
                    })
                    .collect();
                self.callbacks.on_subscribe(SubscribeAck {
                    pkid: ack.pkid,
                    granted,
                });
            }
            Packet::Publish(publish) => {
                self.callbacks.on_message(MQTTMessage::from_publish(&publish));
            }
            Packet::PubAck(ack) => {
                self.final_publish
                    .send_if_modified(|stage| stage.on_puback(ack.pkid));
            }
            Packet::Disconnect => {
                self.connected.send_replace(false);
                self.callbacks
                    .on_disconnect(DisconnectReason::ServerInitiated);
            }
            _ => {}
        }
    }

    fn handle_error(&self, err: ConnectionError) {
        if self.connected.send_replace(false) {
            warn!("Connection to {} lost: {}", self.address, err);
            self.callbacks
                .on_disconnect(DisconnectReason::ConnectionLost(err.to_string()));
            return;
        }
        match err {
            ConnectionError::ConnectionRefused(code) => {
                let description = describe_connect_code(code);
                error!(
                    "Could not connect to {} ({}), will retry in {} seconds",
                    self.address,
                    description,
                    RETRY_INTERVAL.as_secs()
                );
                self.callbacks
                    .on_connect(ConnectOutcome::Refused(description.to_string()));
            }
            other => {
                error!(
                    "Could not connect to {}: {}, will retry in {} seconds",
                    self.address,
                    other,
                    RETRY_INTERVAL.as_secs()
                );
                self.callbacks
                    .on_connect(ConnectOutcome::Unreachable(other.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::MqttConfig;

    #[test]
    fn test_connection_state_wire_form() {
        assert_eq!(ConnectionState::default().as_str(), "DISCONNECTED");
        assert_eq!(ConnectionState::Connecting.to_string(), "CONNECTING");
        assert_eq!(ConnectionState::Connected.as_str(), "CONNECTED");
        assert_eq!(ConnectionState::Error.as_str(), "ERROR");
    }

    #[test]
    fn test_connect_code_descriptions() {
        assert_eq!(
            describe_connect_code(ConnectReturnCode::BadUserNamePassword),
            "Bad user name or password"
        );
        assert_eq!(
            describe_connect_code(ConnectReturnCode::NotAuthorized),
            "Not authorized"
        );
    }

    #[test]
    fn test_final_publish_waits_for_its_own_puback() {
        let mut stage = FinalPublish::AwaitFence;
        assert!(!stage.on_publish(7));
        assert!(!stage.on_puback(7));
        assert!(stage.on_unsubscribe());
        assert!(stage.on_publish(42));
        assert!(!stage.on_publish(43));
        assert!(!stage.on_puback(41));
        assert_eq!(stage, FinalPublish::AwaitAck(42));
        assert!(stage.on_puback(42));
        assert_eq!(stage, FinalPublish::Acked);
        assert!(!FinalPublish::Idle.on_unsubscribe());
    }

    #[tokio::test]
    async fn test_disconnect_without_session_returns_immediately() {
        let config = MqttConfig::new("127.0.0.1", "carbridge-test");
        let will = LastWill::new("p/status", "DISCONNECTED", QoS::AtLeastOnce, true);
        let handler = MqttHandler::new(&config, will).unwrap();
        handler
            .disconnect(
                Some(("p/status".to_string(), b"DISCONNECTED".to_vec())),
                Duration::from_secs(30),
            )
            .await;
        assert!(!handler.is_connected());
    }

    #[tokio::test]
    async fn test_requests_are_queued_without_network() {
        let config = MqttConfig::new("localhost", "carbridge-test");
        let will = LastWill::new("p/status", "DISCONNECTED", QoS::AtLeastOnce, true);
        let handler = MqttHandler::new(&config, will).unwrap();
        handler
            .publish("p/a", b"1".to_vec(), QoS::AtLeastOnce, true)
            .unwrap();
        handler.subscribe("p/a_writetopic", QoS::AtMostOnce).unwrap();
        assert!(!handler.is_connected());
    }

    #[tokio::test]
    async fn test_start_only_once() {
        struct Silent;
        impl BrokerCallbacks for Silent {
            fn on_connect(&self, _: ConnectOutcome) {}
            fn on_disconnect(&self, _: DisconnectReason) {}
            fn on_subscribe(&self, _: SubscribeAck) {}
            fn on_message(&self, _: MQTTMessage) {}
        }

        let config = MqttConfig::new("127.0.0.1", "carbridge-test");
        let will = LastWill::new("p/status", "DISCONNECTED", QoS::AtLeastOnce, true);
        let handler = MqttHandler::new(&config, will).unwrap();
        let cancel = CancellationToken::new();
        let tasks = handler.start(Arc::new(Silent), cancel.clone()).unwrap();
        assert!(matches!(
            handler.start(Arc::new(Silent), cancel.clone()),
            Err(BrokerError::AlreadyStarted)
        ));
        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
