use crate::nat::HolePunchStrategy;
use crate::types::{print, MachineId, NatType, NetError, PrintSender};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const DEAD_AFTER: Duration = Duration::from_secs(90);

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Client -> server signaling. Every message carries an ISO-8601 date.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Register {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
        #[serde(rename = "publicKey")]
        public_key: String,
        date: String,
    },
    ReportEndpoint {
        endpoint: String,
        #[serde(rename = "natType")]
        nat_type: NatType,
        date: String,
    },
    RequestConnection {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
        date: String,
    },
    HolePunchReady {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
        date: String,
    },
    HolePunchSent {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
        date: String,
    },
    HolePunchResult {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
        success: bool,
        endpoint: Option<String>,
        date: String,
    },
    RequestRelay {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
        date: String,
    },
    Ping {
        date: String,
    },
}

impl ClientMessage {
    pub fn register(peer_id: MachineId, public_key: String) -> Self {
        ClientMessage::Register {
            peer_id,
            public_key,
            date: now_iso8601(),
        }
    }

    pub fn report_endpoint(endpoint: String, nat_type: NatType) -> Self {
        ClientMessage::ReportEndpoint {
            endpoint,
            nat_type,
            date: now_iso8601(),
        }
    }

    pub fn request_connection(peer_id: MachineId) -> Self {
        ClientMessage::RequestConnection {
            peer_id,
            date: now_iso8601(),
        }
    }

    pub fn hole_punch_ready(peer_id: MachineId) -> Self {
        ClientMessage::HolePunchReady {
            peer_id,
            date: now_iso8601(),
        }
    }

    pub fn hole_punch_sent(peer_id: MachineId) -> Self {
        ClientMessage::HolePunchSent {
            peer_id,
            date: now_iso8601(),
        }
    }

    pub fn hole_punch_result(peer_id: MachineId, success: bool, endpoint: Option<String>) -> Self {
        ClientMessage::HolePunchResult {
            peer_id,
            success,
            endpoint,
            date: now_iso8601(),
        }
    }

    pub fn request_relay(peer_id: MachineId) -> Self {
        ClientMessage::RequestRelay {
            peer_id,
            date: now_iso8601(),
        }
    }

    pub fn ping() -> Self {
        ClientMessage::Ping { date: now_iso8601() }
    }
}

/// Server -> client signaling. The server guarantees `holePunchStrategy`
/// arrives before any of the punch-now family for the same session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Registered {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
    },
    PeerEndpoint {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
        endpoint: String,
        #[serde(rename = "natType")]
        nat_type: NatType,
    },
    HolePunchStrategy {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
        strategy: HolePunchStrategy,
    },
    HolePunchNow {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
    },
    HolePunchInitiate {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
    },
    HolePunchWait {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
    },
    HolePunchContinue {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
    },
    RelayAssigned {
        #[serde(rename = "peerId")]
        peer_id: MachineId,
        relay: String,
        token: u32,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Canonical JSON: route through `serde_json::Value`, whose object maps are
/// BTreeMaps, so keys come out sorted and equal values encode byte-equal.
pub fn encode_canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, NetError> {
    let value =
        serde_json::to_value(value).map_err(|e| NetError::Transport(format!("encode: {e}")))?;
    serde_json::to_vec(&value).map_err(|e| NetError::Transport(format!("encode: {e}")))
}

/// Long-lived signaling connection. One writer task owns the sink, one
/// reader task owns the stream and routes everything except keepalive
/// traffic to the single consumer; a keepalive task pings and watches for
/// the connection going quiet.
pub struct RendezvousClient {
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RendezvousClient {
    pub async fn connect(url: &str, print_tx: PrintSender) -> Result<Self, NetError> {
        let parsed = url::Url::parse(url)
            .map_err(|_| NetError::InvalidConfiguration(format!("bad rendezvous url: {url}")))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(NetError::InvalidConfiguration(format!(
                "rendezvous url must be ws:// or wss://, got {url}"
            )));
        }
        let (websocket, _response) = connect_async(url)
            .await
            .map_err(|e| NetError::Transport(format!("rendezvous connect: {e}")))?;
        let (mut sink, mut stream) = websocket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let last_pong = Arc::new(Mutex::new(Instant::now()));

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let Ok(bytes) = encode_canonical(&message) else {
                    continue;
                };
                if sink
                    .send(tungstenite::Message::Text(
                        String::from_utf8(bytes).expect("json is utf-8"),
                    ))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let reader_pong = last_pong.clone();
        let reader_print = print_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                let text = match message {
                    tungstenite::Message::Text(text) => text,
                    tungstenite::Message::Binary(bin) => match String::from_utf8(bin) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    _ => continue,
                };
                let Ok(server_message) = serde_json::from_str::<ServerMessage>(&text) else {
                    print(&reader_print, 1, format!("rendezvous: unparseable message: {text}"))
                        .await;
                    continue;
                };
                if matches!(server_message, ServerMessage::Pong) {
                    *reader_pong.lock().expect("pong lock poisoned") = Instant::now();
                    continue;
                }
                if in_tx.send(server_message).is_err() {
                    break;
                }
            }
        });

        let keepalive_tx = out_tx.clone();
        let keepalive_pong = last_pong;
        let keepalive_print = print_tx;
        let keepalive = tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick is immediate; the ping cadence starts one
            // interval in
            interval.tick().await;
            loop {
                interval.tick().await;
                if keepalive_pong
                    .lock()
                    .expect("pong lock poisoned")
                    .elapsed()
                    > DEAD_AFTER
                {
                    print(&keepalive_print, 0, "rendezvous: connection went quiet".into()).await;
                    break;
                }
                if keepalive_tx.send(ClientMessage::ping()).is_err() {
                    break;
                }
            }
        });

        Ok(RendezvousClient {
            out_tx,
            messages: Mutex::new(Some(in_rx)),
            tasks: Mutex::new(vec![writer, reader, keepalive]),
        })
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), NetError> {
        self.out_tx
            .send(message)
            .map_err(|_| NetError::NotConnected)
    }

    /// The inbound signaling stream; single consumer, taken once.
    pub fn take_messages(&self) -> Result<mpsc::UnboundedReceiver<ServerMessage>, NetError> {
        self.messages
            .lock()
            .expect("messages lock poisoned")
            .take()
            .ok_or(NetError::AlreadyConnected)
    }

    pub fn close(&self) {
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
    }
}

impl Drop for RendezvousClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn canonical_encoding_is_byte_stable_and_sorted() {
        let message = ClientMessage::Register {
            peer_id: "abc123".into(),
            public_key: "deadbeef".into(),
            date: "2024-01-15T10:30:00+00:00".into(),
        };
        let a = encode_canonical(&message).unwrap();
        let b = encode_canonical(&message).unwrap();
        assert_eq!(a, b);
        let text = String::from_utf8(a).unwrap();
        // object keys appear in sorted order
        let date_at = text.find("\"date\"").unwrap();
        let peer_at = text.find("\"peerId\"").unwrap();
        let key_at = text.find("\"publicKey\"").unwrap();
        let type_at = text.find("\"type\"").unwrap();
        assert!(date_at < peer_at && peer_at < key_at && key_at < type_at);
    }

    #[test]
    fn message_roundtrips() {
        let messages = vec![
            serde_json::to_string(&ServerMessage::Registered { peer_id: "p".into() }).unwrap(),
            serde_json::to_string(&ServerMessage::HolePunchStrategy {
                peer_id: "p".into(),
                strategy: HolePunchStrategy::Simultaneous,
            })
            .unwrap(),
            serde_json::to_string(&ServerMessage::RelayAssigned {
                peer_id: "p".into(),
                relay: "relay.example.com:3479".into(),
                token: 7,
            })
            .unwrap(),
        ];
        for text in messages {
            let parsed: ServerMessage = serde_json::from_str(&text).unwrap();
            assert_eq!(serde_json::to_string(&parsed).unwrap(), text);
        }
        // the wire tag is the camelCase variant name
        let text = serde_json::to_string(&ServerMessage::HolePunchNow { peer_id: "p".into() })
            .unwrap();
        assert!(text.contains("\"type\":\"holePunchNow\""));
    }

    #[tokio::test]
    async fn rejects_non_websocket_urls() {
        let (print_tx, _rx) = mpsc::channel(4);
        for url in ["", "not a url", "http://example.com/signal"] {
            let result = RendezvousClient::connect(url, print_tx.clone()).await;
            assert!(matches!(result, Err(NetError::InvalidConfiguration(_))));
        }
    }

    #[tokio::test]
    async fn client_against_scripted_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut websocket = accept_async(stream).await.unwrap();
            // expect a register, answer with the strategy-before-signal pair
            let Some(Ok(tungstenite::Message::Text(text))) = websocket.next().await else {
                panic!("expected register");
            };
            let message: ClientMessage = serde_json::from_str(&text).unwrap();
            let ClientMessage::Register { peer_id, .. } = message else {
                panic!("expected register, got {message:?}");
            };
            for reply in [
                ServerMessage::Registered { peer_id: peer_id.clone() },
                ServerMessage::HolePunchStrategy {
                    peer_id: "other".into(),
                    strategy: HolePunchStrategy::Simultaneous,
                },
                ServerMessage::HolePunchNow { peer_id: "other".into() },
            ] {
                let bytes = encode_canonical(&reply).unwrap();
                websocket
                    .send(tungstenite::Message::Text(String::from_utf8(bytes).unwrap()))
                    .await
                    .unwrap();
            }
        });

        let (print_tx, _rx) = mpsc::channel(16);
        let client = RendezvousClient::connect(&format!("ws://{addr}"), print_tx)
            .await
            .unwrap();
        let mut messages = client.take_messages().unwrap();
        assert!(client.take_messages().is_err());

        client
            .send(ClientMessage::register("peer-1".into(), "cafe".into()))
            .unwrap();

        assert_eq!(
            messages.recv().await.unwrap(),
            ServerMessage::Registered { peer_id: "peer-1".into() }
        );
        // strategy strictly precedes the punch signal
        let strategy = messages.recv().await.unwrap();
        assert!(matches!(strategy, ServerMessage::HolePunchStrategy { .. }));
        let signal = messages.recv().await.unwrap();
        assert!(matches!(signal, ServerMessage::HolePunchNow { .. }));
        client.close();
    }
}
