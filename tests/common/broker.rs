//! Minimal in-process MQTT 3.1.1 broker for shutdown tests.
//!
//! Accepts one client, answers CONNECT/SUBSCRIBE/UNSUBSCRIBE/PINGREQ right
//! away and delays every PUBACK by a fixed amount.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Publish { topic: String, payload: Vec<u8> },
    Unsubscribe(u16),
    Disconnect,
}

pub struct SlowAckBroker {
    pub port: u16,
    events: Arc<Mutex<Vec<BrokerEvent>>>,
}

impl SlowAckBroker {
    pub async fn start(ack_delay: Duration) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let events = Arc::new(Mutex::new(Vec::new()));

        let recorded = events.clone();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let (reader, mut writer) = stream.into_split();
                let (replies, mut outgoing) = mpsc::unbounded_channel::<Vec<u8>>();
                tokio::spawn(async move {
                    while let Some(bytes) = outgoing.recv().await {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                });
                let _ = serve(reader, replies, recorded, ack_delay).await;
            }
        });
        Ok(SlowAckBroker { port, events })
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.events.lock().clone()
    }

    /// Payloads published to `topic`, in arrival order.
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Publish { topic: t, payload } if t == topic => {
                    Some(String::from_utf8_lossy(payload).into_owned())
                }
                _ => None,
            })
            .collect()
    }
}

async fn read_packet(reader: &mut OwnedReadHalf) -> std::io::Result<(u8, Vec<u8>)> {
    let header = reader.read_u8().await?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await?;
        length |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

async fn serve(
    mut reader: OwnedReadHalf,
    replies: mpsc::UnboundedSender<Vec<u8>>,
    events: Arc<Mutex<Vec<BrokerEvent>>>,
    ack_delay: Duration,
) -> std::io::Result<()> {
    loop {
        let (header, body) = read_packet(&mut reader).await?;
        match header >> 4 {
            1 => {
                let _ = replies.send(vec![0x20, 0x02, 0x00, 0x00]);
            }
            3 => {
                let qos = (header >> 1) & 0x03;
                let topic_len = be_u16(&body) as usize;
                let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
                let mut offset = 2 + topic_len;
                let pkid = if qos > 0 {
                    let pkid = be_u16(&body[offset..]);
                    offset += 2;
                    Some(pkid)
                } else {
                    None
                };
                events.lock().push(BrokerEvent::Publish {
                    topic,
                    payload: body[offset..].to_vec(),
                });
                if let Some(pkid) = pkid {
                    let [hi, lo] = pkid.to_be_bytes();
                    // PUBREC for QoS 2, PUBACK otherwise
                    let kind = if qos == 2 { 0x50 } else { 0x40 };
                    let replies = replies.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(ack_delay).await;
                        let _ = replies.send(vec![kind, 0x02, hi, lo]);
                    });
                }
            }
            6 => {
                let [hi, lo] = be_u16(&body).to_be_bytes();
                let _ = replies.send(vec![0x70, 0x02, hi, lo]);
            }
            8 => {
                let pkid = be_u16(&body);
                // one requested QoS byte per topic filter
                let mut granted = Vec::new();
                let mut offset = 2;
                while offset < body.len() {
                    let len = be_u16(&body[offset..]) as usize;
                    offset += 2 + len;
                    granted.push(body[offset].min(2));
                    offset += 1;
                }
                let [hi, lo] = pkid.to_be_bytes();
                let mut reply = vec![0x90, (2 + granted.len()) as u8, hi, lo];
                reply.extend(granted);
                let _ = replies.send(reply);
            }
            10 => {
                let pkid = be_u16(&body);
                events.lock().push(BrokerEvent::Unsubscribe(pkid));
                let [hi, lo] = pkid.to_be_bytes();
                let _ = replies.send(vec![0xb0, 0x02, hi, lo]);
            }
            12 => {
                let _ = replies.send(vec![0xd0, 0x00]);
            }
            14 => {
                events.lock().push(BrokerEvent::Disconnect);
                return Ok(());
            }
            _ => {}
        }
    }
}
