use crate::dht::routing::{dht_key, DhtKey, DhtNodeInfo};
use crate::identity::{self, IdentityKeypair};
use crate::types::NetError;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

/// A signed statement that a peer is reachable for signaling. Stored by any
/// node within k XOR-distance of the announcement key; gone on expiry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub peer_id: String,
    pub public_key: Vec<u8>,
    pub capabilities: Vec<String>,
    pub signaling_addresses: Vec<String>,
    pub timestamp: u64,
    pub ttl: u64,
    pub signature: Vec<u8>,
}

impl PeerAnnouncement {
    /// Sign the announcement fields with the announcing identity.
    pub fn signed(
        keypair: &IdentityKeypair,
        capabilities: Vec<String>,
        signaling_addresses: Vec<String>,
        ttl: u64,
    ) -> Self {
        let peer_id = keypair.peer_id();
        let public_key = keypair.public_key();
        let timestamp = now_seconds();
        let payload = signable(&peer_id, &public_key, &capabilities, &signaling_addresses, timestamp, ttl);
        let signature = keypair.sign(&payload);
        PeerAnnouncement {
            peer_id,
            public_key,
            capabilities,
            signaling_addresses,
            timestamp,
            ttl,
            signature,
        }
    }

    /// The signature must verify against the contained public key, and the
    /// peer id must actually be derived from that key, or anyone could
    /// announce under someone else's id with their own key.
    pub fn verify(&self) -> bool {
        if identity::peer_id_from_public_key(&self.public_key) != self.peer_id {
            return false;
        }
        let payload = signable(
            &self.peer_id,
            &self.public_key,
            &self.capabilities,
            &self.signaling_addresses,
            self.timestamp,
            self.ttl,
        );
        identity::verify(&self.public_key, &payload, &self.signature)
    }

    pub fn expired(&self) -> bool {
        now_seconds() > self.timestamp.saturating_add(self.ttl)
    }

    pub fn dht_key(&self) -> DhtKey {
        dht_key(self.peer_id.as_bytes())
    }
}

fn signable(
    peer_id: &str,
    public_key: &[u8],
    capabilities: &[String],
    signaling_addresses: &[String],
    timestamp: u64,
    ttl: u64,
) -> Vec<u8> {
    bincode::serialize(&(
        peer_id,
        public_key,
        capabilities,
        signaling_addresses,
        timestamp,
        ttl,
    ))
    .expect("announcement fields serialize")
}

fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs()
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DhtMessage {
    Ping,
    Pong,
    FindNode { target: DhtKey },
    FoundNodes { nodes: Vec<DhtNodeInfo> },
    Store { announcement: PeerAnnouncement },
    FindValue { key: DhtKey },
    Value { announcement: PeerAnnouncement },
    NotFound { closest: Vec<DhtNodeInfo> },
}

impl DhtMessage {
    /// Responses are matched to waiters by transaction id; everything else
    /// is a request the node loop must answer.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            DhtMessage::Pong
                | DhtMessage::FoundNodes { .. }
                | DhtMessage::Value { .. }
                | DhtMessage::NotFound { .. }
        )
    }
}

/// One datagram on the DHT socket. The transaction id is random per packet
/// so identical payloads are still distinct on the wire. Every packet names
/// its sender, which is how routing tables fill from ordinary traffic.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DhtPacket {
    pub transaction_id: u64,
    pub sender: DhtNodeInfo,
    pub message: DhtMessage,
}

impl DhtPacket {
    pub fn request(sender: DhtNodeInfo, message: DhtMessage) -> Self {
        DhtPacket {
            transaction_id: random_transaction_id(),
            sender,
            message,
        }
    }

    pub fn response(transaction_id: u64, sender: DhtNodeInfo, message: DhtMessage) -> Self {
        DhtPacket {
            transaction_id,
            sender,
            message,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("dht packet serialization cannot fail")
    }

    pub fn decode(buf: &[u8]) -> Result<Self, NetError> {
        bincode::deserialize(buf).map_err(|e| NetError::Transport(format!("bad dht packet: {e}")))
    }
}

fn random_transaction_id() -> u64 {
    let rng = SystemRandom::new();
    loop {
        let mut bytes = [0u8; 8];
        rng.fill(&mut bytes).expect("system rng failed");
        let id = u64::from_be_bytes(bytes);
        if id != 0 {
            return id;
        }
    }
}
