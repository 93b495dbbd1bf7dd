use crate::types::{MachineId, NetError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 10 MB cap per channel message; apps chunk anything bigger.
pub const MESSAGE_MAX_SIZE: usize = 10_485_800;

/// Per-channel inbound reorder window and outbound queue depth. Past this
/// the mesh drops with a counter instead of queueing without bound.
pub const CHANNEL_QUEUE_DEPTH: usize = 256;

/// Invoked per delivered message, in send order per (sender, channel).
pub type ChannelHandler = Arc<dyn Fn(MachineId, Vec<u8>) + Send + Sync>;

/// Named bidirectional byte channels between pairs of online machines.
/// Delivery is reliable and ordered within a channel; nothing is promised
/// across channels. Registering a handler for an occupied channel replaces
/// the previous handler atomically.
#[async_trait::async_trait]
pub trait MeshProvider: Send + Sync {
    async fn send_on_channel(
        &self,
        to: &MachineId,
        channel: &str,
        bytes: Vec<u8>,
    ) -> Result<(), NetError>;
    fn on_channel(&self, channel: &str, handler: ChannelHandler);
    fn off_channel(&self, channel: &str);
    fn local_machine(&self) -> MachineId;
}

/// One application message inside the encrypted transport. `msg_id` is
/// unique per peer link and drives acks and deduplication; `seq` orders
/// delivery within its channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub msg_id: u64,
    pub channel: String,
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// Cleartext handshake payload, sent inside the noise XX pattern exactly as
/// the connection protocol requires: the long-lived identity key signs the
/// ephemeral noise static key, binding this transport session to the peer id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub protocol_version: u8,
    pub machine_id: MachineId,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Ciphertext fragment size; a fragment plus framing always fits one UDP
/// datagram.
pub const FRAGMENT_SIZE: usize = 32 * 1024;

/// Datagram-level frames on the peer link. Handshake frames are cleartext
/// noise pattern messages; data and acks carry the explicit nonce their
/// ciphertext was sealed with, so datagram loss never desynchronizes the
/// transport. Messages above one fragment are split and reassembled by
/// `msg_id`; the ack covers the whole message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MeshFrame {
    /// initiator -> responder: noise `e`
    HandshakeInit(Vec<u8>),
    /// responder -> initiator: noise `e, ee, s, es` + HandshakePayload
    HandshakeReply(Vec<u8>),
    /// initiator -> responder: noise `s, se` + HandshakePayload
    HandshakeFinal(Vec<u8>),
    Data {
        msg_id: u64,
        frag_index: u32,
        frag_count: u32,
        nonce: u64,
        ciphertext: Vec<u8>,
    },
    Ack {
        nonce: u64,
        ciphertext: Vec<u8>,
    },
}

impl MeshFrame {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("mesh frame serialization cannot fail")
    }

    pub fn decode(buf: &[u8]) -> Result<Self, NetError> {
        bincode::deserialize(buf).map_err(|e| NetError::Transport(format!("bad mesh frame: {e}")))
    }
}
