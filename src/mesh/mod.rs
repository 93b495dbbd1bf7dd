use crate::identity::IdentityKeypair;
use crate::packet::Endpoint;
use crate::types::{print, MachineId, NetError, PrintSender};
use anyhow::anyhow;
use dashmap::DashMap;
use snow::StatelessTransportState;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub mod types;
pub mod utils;

pub use types::{
    ChannelHandler, ChannelMessage, HandshakePayload, MeshFrame, MeshProvider,
    CHANNEL_QUEUE_DEPTH, FRAGMENT_SIZE, MESSAGE_MAX_SIZE,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_RESEND: Duration = Duration::from_millis(300);
const RETRANSMIT_AFTER: Duration = Duration::from_millis(250);
const MAX_RETRANSMITS: u32 = 10;
/// completed msg ids remembered for re-acking lost acks
const DONE_WINDOW: usize = 1024;

struct OutboundMessage {
    channel: String,
    payload: Vec<u8>,
}

struct PeerLink {
    link_id: u64,
    sender: mpsc::Sender<OutboundMessage>,
    task: tokio::task::JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

struct UdpMeshInner {
    keypair: Arc<IdentityKeypair>,
    handlers: Arc<DashMap<String, ChannelHandler>>,
    peers: DashMap<MachineId, PeerLink>,
    print_tx: PrintSender,
}

/// Channel provider over per-peer UDP links (direct, hole-punched, or
/// relayed sockets all look the same here). Each link runs a noise XX
/// handshake bound to the identity keypair, then carries encrypted
/// `ChannelMessage` frames with per-message acks and retransmission, so a
/// channel is reliable and ordered even though the wire is datagrams.
pub struct UdpMesh {
    inner: Arc<UdpMeshInner>,
}

impl UdpMesh {
    pub fn new(keypair: Arc<IdentityKeypair>, print_tx: PrintSender) -> Self {
        UdpMesh {
            inner: Arc::new(UdpMeshInner {
                keypair,
                handlers: Arc::new(DashMap::new()),
                peers: DashMap::new(),
                print_tx,
            }),
        }
    }

    /// Take over a socket whose far side is `remote` (for the initiator) or
    /// as-yet-unknown (for the responder, which learns it from the first
    /// handshake datagram). Role assignment comes from the traversal layer.
    pub async fn connect_peer(
        &self,
        socket: UdpSocket,
        remote: Endpoint,
        initiator: bool,
    ) -> Result<MachineId, NetError> {
        let established = if initiator {
            handshake_initiator(&socket, remote.to_socket_addr(), &self.inner.keypair).await
        } else {
            handshake_responder(&socket, &self.inner.keypair).await
        }
        .map_err(into_net_error)?;
        let machine_id = established.machine_id.clone();

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        let dropped = Arc::new(AtomicU64::new(0));
        let link_id = rand::random();
        let task = tokio::spawn(maintain_link(
            self.inner.clone(),
            link_id,
            machine_id.clone(),
            socket,
            established,
            out_rx,
            dropped.clone(),
        ));
        // a reconnect replaces the old link; kill the loser
        if let Some(old) = self.inner.peers.insert(
            machine_id.clone(),
            PeerLink {
                link_id,
                sender: out_tx,
                task,
                dropped,
            },
        ) {
            old.task.abort();
        }
        Ok(machine_id)
    }

    pub fn disconnect_peer(&self, machine_id: &MachineId) {
        if let Some((_, link)) = self.inner.peers.remove(machine_id) {
            link.task.abort();
        }
    }

    pub fn is_connected(&self, machine_id: &MachineId) -> bool {
        self.inner.peers.contains_key(machine_id)
    }

    pub fn dropped_for(&self, machine_id: &MachineId) -> u64 {
        self.inner
            .peers
            .get(machine_id)
            .map(|link| link.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn stop(&self) {
        self.inner.peers.retain(|_, link| {
            link.task.abort();
            false
        });
    }
}

#[async_trait::async_trait]
impl MeshProvider for UdpMesh {
    async fn send_on_channel(
        &self,
        to: &MachineId,
        channel: &str,
        bytes: Vec<u8>,
    ) -> Result<(), NetError> {
        if bytes.len() > MESSAGE_MAX_SIZE {
            return Err(NetError::Transport("message exceeds size cap".into()));
        }
        let link = self.inner.peers.get(to).ok_or(NetError::NotConnected)?;
        let message = OutboundMessage {
            channel: channel.to_string(),
            payload: bytes,
        };
        // bounded queue: overload drops with a counter, never accumulates
        if link.sender.try_send(message).is_err() {
            link.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(NetError::Transport("channel backlog full".into()));
        }
        Ok(())
    }

    fn on_channel(&self, channel: &str, handler: ChannelHandler) {
        self.inner.handlers.insert(channel.to_string(), handler);
    }

    fn off_channel(&self, channel: &str) {
        self.inner.handlers.remove(channel);
    }

    fn local_machine(&self) -> MachineId {
        self.inner.keypair.peer_id()
    }
}

/// Everything the handshake hands off to the link loop.
struct EstablishedLink {
    machine_id: MachineId,
    remote: SocketAddr,
    transport: StatelessTransportState,
    /// retransmitted when the peer shows it missed our last handshake frame
    resend_frame: Vec<u8>,
    /// which handshake frame kind signals that miss
    resend_on_reply: bool,
}

/// Typed errors cross the public boundary; everything else inside the
/// handshake rides anyhow and degrades to a transport error here.
fn into_net_error(e: anyhow::Error) -> NetError {
    match e.downcast::<NetError>() {
        Ok(net) => net,
        Err(other) => NetError::Transport(other.to_string()),
    }
}

async fn handshake_initiator(
    socket: &UdpSocket,
    remote: SocketAddr,
    keypair: &IdentityKeypair,
) -> anyhow::Result<EstablishedLink> {
    let (mut noise, static_key) = utils::build_initiator()?;
    let mut buf = vec![0u8; 65535];

    // -> e
    let len = noise.write_message(&[], &mut buf)?;
    let init_frame = MeshFrame::HandshakeInit(buf[..len].to_vec()).encode();

    let started = Instant::now();
    let reply = loop {
        if started.elapsed() > HANDSHAKE_TIMEOUT {
            return Err(NetError::Timeout.into());
        }
        socket.send_to(&init_frame, remote).await?;
        let mut recv_buf = vec![0u8; 65535];
        match tokio::time::timeout(HANDSHAKE_RESEND, socket.recv_from(&mut recv_buf)).await {
            Ok(Ok((len, _from))) => {
                if let Ok(MeshFrame::HandshakeReply(bytes)) = MeshFrame::decode(&recv_buf[..len]) {
                    break bytes;
                }
            }
            _ => continue,
        }
    };

    // <- e, ee, s, es
    let payload_len = noise.read_message(&reply, &mut buf)?;
    let their_payload: HandshakePayload = bincode::deserialize(&buf[..payload_len])?;
    let remote_static = noise
        .get_remote_static()
        .ok_or_else(|| anyhow!("noise: missing remote static key"))?;
    let machine_id = utils::validate_handshake(&their_payload, remote_static)?;

    // -> s, se
    let our_payload = bincode::serialize(&utils::make_handshake_payload(keypair, &static_key))
        .expect("handshake payload serializes");
    let len = noise.write_message(&our_payload, &mut buf)?;
    let final_frame = MeshFrame::HandshakeFinal(buf[..len].to_vec()).encode();
    socket.send_to(&final_frame, remote).await?;

    let transport = noise.into_stateless_transport_mode()?;
    Ok(EstablishedLink {
        machine_id,
        remote,
        transport,
        resend_frame: final_frame,
        resend_on_reply: true,
    })
}

async fn handshake_responder(
    socket: &UdpSocket,
    keypair: &IdentityKeypair,
) -> anyhow::Result<EstablishedLink> {
    let started = Instant::now();
    let mut buf = vec![0u8; 65535];

    // <- e (from whoever probes first; NATs may rewrite the source we expect)
    let (first, remote) = loop {
        if started.elapsed() > HANDSHAKE_TIMEOUT {
            return Err(NetError::Timeout.into());
        }
        let mut recv_buf = vec![0u8; 65535];
        match tokio::time::timeout(HANDSHAKE_RESEND, socket.recv_from(&mut recv_buf)).await {
            Ok(Ok((len, from))) => {
                if let Ok(MeshFrame::HandshakeInit(bytes)) = MeshFrame::decode(&recv_buf[..len]) {
                    break (bytes, from);
                }
            }
            _ => continue,
        }
    };

    let (mut noise, static_key) = utils::build_responder()?;
    noise.read_message(&first, &mut buf)?;

    // -> e, ee, s, es
    let our_payload = bincode::serialize(&utils::make_handshake_payload(keypair, &static_key))
        .expect("handshake payload serializes");
    let len = noise.write_message(&our_payload, &mut buf)?;
    let reply_frame = MeshFrame::HandshakeReply(buf[..len].to_vec()).encode();

    // <- s, se; resend the reply until the final frame arrives
    let final_bytes = loop {
        if started.elapsed() > HANDSHAKE_TIMEOUT {
            return Err(NetError::Timeout.into());
        }
        socket.send_to(&reply_frame, remote).await?;
        let mut recv_buf = vec![0u8; 65535];
        match tokio::time::timeout(HANDSHAKE_RESEND, socket.recv_from(&mut recv_buf)).await {
            Ok(Ok((len, from))) if from == remote => {
                match MeshFrame::decode(&recv_buf[..len]) {
                    Ok(MeshFrame::HandshakeFinal(bytes)) => break bytes,
                    // a duplicated init means our reply was lost; loop resends
                    _ => continue,
                }
            }
            _ => continue,
        }
    };

    let payload_len = noise.read_message(&final_bytes, &mut buf)?;
    let their_payload: HandshakePayload = bincode::deserialize(&buf[..payload_len])?;
    let remote_static = noise
        .get_remote_static()
        .ok_or_else(|| anyhow!("noise: missing remote static key"))?;
    let machine_id = utils::validate_handshake(&their_payload, remote_static)?;

    let transport = noise.into_stateless_transport_mode()?;
    Ok(EstablishedLink {
        machine_id,
        remote,
        transport,
        resend_frame: reply_frame,
        resend_on_reply: false,
    })
}

#[derive(Default)]
struct InboundChannel {
    next_seq: u64,
    buffer: BTreeMap<u64, Vec<u8>>,
}

struct PendingSend {
    frames: Vec<Vec<u8>>,
    last_sent: Instant,
    attempts: u32,
}

struct Reassembly {
    frag_count: u32,
    fragments: BTreeMap<u32, Vec<u8>>,
}

/// One task per peer link; owns the socket and every piece of link state.
/// Exits when the peer stops acking, the socket dies, or the link is
/// replaced.
async fn maintain_link(
    inner: Arc<UdpMeshInner>,
    link_id: u64,
    machine_id: MachineId,
    socket: UdpSocket,
    link: EstablishedLink,
    mut out_rx: mpsc::Receiver<OutboundMessage>,
    dropped: Arc<AtomicU64>,
) {
    let EstablishedLink {
        remote,
        transport,
        resend_frame,
        resend_on_reply,
        ..
    } = link;

    let mut send_nonce: u64 = 0;
    let mut next_msg_id: u64 = 0;
    let mut out_seq: HashMap<String, u64> = HashMap::new();
    let mut inbound: HashMap<String, InboundChannel> = HashMap::new();
    let mut unacked: HashMap<u64, PendingSend> = HashMap::new();
    let mut reassembly: HashMap<u64, Reassembly> = HashMap::new();
    let mut done_ids: HashSet<u64> = HashSet::new();
    let mut done_order: VecDeque<u64> = VecDeque::new();

    let mut recv_buf = vec![0u8; 65535];
    let mut crypt_buf = vec![0u8; 65535];
    let mut retransmit = tokio::time::interval(RETRANSMIT_AFTER);
    retransmit.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit_reason: String = loop {
        tokio::select! {
            maybe_out = out_rx.recv() => {
                let Some(message) = maybe_out else {
                    break "link closed locally".into();
                };
                let msg_id = next_msg_id;
                next_msg_id += 1;
                let seq = out_seq.entry(message.channel.clone()).or_insert(0);
                let channel_message = ChannelMessage {
                    msg_id,
                    channel: message.channel,
                    seq: *seq,
                    payload: message.payload,
                };
                *seq += 1;

                let plaintext = bincode::serialize(&channel_message)
                    .expect("channel message serializes");
                let mut frames = Vec::new();
                let chunks: Vec<&[u8]> = plaintext.chunks(FRAGMENT_SIZE).collect();
                let frag_count = chunks.len() as u32;
                let mut sealed = true;
                for (frag_index, chunk) in chunks.into_iter().enumerate() {
                    let nonce = send_nonce;
                    send_nonce += 1;
                    let Ok(len) = transport.write_message(nonce, chunk, &mut crypt_buf) else {
                        sealed = false;
                        break;
                    };
                    frames.push(
                        MeshFrame::Data {
                            msg_id,
                            frag_index: frag_index as u32,
                            frag_count,
                            nonce,
                            ciphertext: crypt_buf[..len].to_vec(),
                        }
                        .encode(),
                    );
                }
                if !sealed {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let mut sent = true;
                for frame in &frames {
                    if socket.send_to(frame, remote).await.is_err() {
                        sent = false;
                        break;
                    }
                }
                if !sent {
                    break "socket send failed".into();
                }
                unacked.insert(msg_id, PendingSend {
                    frames,
                    last_sent: Instant::now(),
                    attempts: 0,
                });
            }
            recv = socket.recv_from(&mut recv_buf) => {
                let Ok((len, from)) = recv else {
                    break "socket recv failed".into();
                };
                if from != remote {
                    continue;
                }
                let Ok(frame) = MeshFrame::decode(&recv_buf[..len]) else {
                    continue;
                };
                match frame {
                    MeshFrame::Data { msg_id, frag_index, frag_count, nonce, ciphertext } => {
                        if done_ids.contains(&msg_id) {
                            // our ack was lost; repeat it
                            send_ack(&socket, remote, &transport, &mut send_nonce, msg_id).await;
                            continue;
                        }
                        let Ok(plain_len) = transport.read_message(nonce, &ciphertext, &mut crypt_buf) else {
                            continue;
                        };
                        if frag_count == 0 || frag_index >= frag_count {
                            continue;
                        }
                        let entry = reassembly.entry(msg_id).or_insert_with(|| Reassembly {
                            frag_count,
                            fragments: BTreeMap::new(),
                        });
                        entry.fragments.insert(frag_index, crypt_buf[..plain_len].to_vec());
                        if entry.fragments.len() as u32 != entry.frag_count {
                            continue;
                        }
                        let whole: Vec<u8> = reassembly
                            .remove(&msg_id)
                            .expect("entry just observed")
                            .fragments
                            .into_values()
                            .flatten()
                            .collect();
                        let Ok(message) = bincode::deserialize::<ChannelMessage>(&whole) else {
                            continue;
                        };
                        send_ack(&socket, remote, &transport, &mut send_nonce, msg_id).await;
                        done_ids.insert(msg_id);
                        done_order.push_back(msg_id);
                        if done_order.len() > DONE_WINDOW {
                            if let Some(old) = done_order.pop_front() {
                                done_ids.remove(&old);
                            }
                        }
                        deliver_in_order(&inner, &machine_id, &mut inbound, message, &dropped);
                    }
                    MeshFrame::Ack { nonce, ciphertext } => {
                        if let Ok(8) = transport.read_message(nonce, &ciphertext, &mut crypt_buf) {
                            let acked = u64::from_be_bytes(
                                crypt_buf[..8].try_into().expect("8 bytes checked"),
                            );
                            unacked.remove(&acked);
                        }
                    }
                    MeshFrame::HandshakeReply(_) if resend_on_reply => {
                        let _ = socket.send_to(&resend_frame, remote).await;
                    }
                    MeshFrame::HandshakeInit(_) if !resend_on_reply => {
                        let _ = socket.send_to(&resend_frame, remote).await;
                    }
                    _ => {}
                }
            }
            _ = retransmit.tick() => {
                let mut dead = false;
                for pending in unacked.values_mut() {
                    if pending.last_sent.elapsed() < RETRANSMIT_AFTER {
                        continue;
                    }
                    pending.attempts += 1;
                    if pending.attempts > MAX_RETRANSMITS {
                        dead = true;
                        break;
                    }
                    pending.last_sent = Instant::now();
                    for frame in &pending.frames {
                        let _ = socket.send_to(frame, remote).await;
                    }
                }
                if dead {
                    break "peer stopped acking".into();
                }
            }
        }
    };

    print(
        &inner.print_tx,
        1,
        format!("mesh: link to {machine_id} down: {exit_reason}"),
    )
    .await;
    inner
        .peers
        .remove_if(&machine_id, |_, peer| peer.link_id == link_id);
}

async fn send_ack(
    socket: &UdpSocket,
    remote: SocketAddr,
    transport: &StatelessTransportState,
    send_nonce: &mut u64,
    msg_id: u64,
) {
    let nonce = *send_nonce;
    *send_nonce += 1;
    let mut buf = [0u8; 64];
    let Ok(len) = transport.write_message(nonce, &msg_id.to_be_bytes(), &mut buf) else {
        return;
    };
    let frame = MeshFrame::Ack {
        nonce,
        ciphertext: buf[..len].to_vec(),
    };
    let _ = socket.send_to(&frame.encode(), remote).await;
}

/// Per-channel ordering: deliver in seq order, hold what arrived early,
/// drop duplicates, and cap the reorder buffer.
fn deliver_in_order(
    inner: &Arc<UdpMeshInner>,
    from: &MachineId,
    inbound: &mut HashMap<String, InboundChannel>,
    message: ChannelMessage,
    dropped: &Arc<AtomicU64>,
) {
    let channel_state = inbound.entry(message.channel.clone()).or_default();
    if message.seq < channel_state.next_seq {
        return;
    }
    if message.seq > channel_state.next_seq {
        if channel_state.buffer.len() >= CHANNEL_QUEUE_DEPTH {
            dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        channel_state.buffer.insert(message.seq, message.payload);
        return;
    }

    let channel = message.channel;
    let mut ready = vec![message.payload];
    channel_state.next_seq += 1;
    while let Some(payload) = channel_state.buffer.remove(&channel_state.next_seq) {
        ready.push(payload);
        channel_state.next_seq += 1;
    }
    let handler = inner.handlers.get(&channel).map(|h| h.clone());
    match handler {
        Some(handler) => {
            for payload in ready {
                handler(from.clone(), payload);
            }
        }
        None => {
            dropped.fetch_add(ready.len() as u64, Ordering::Relaxed);
        }
    }
}

//
// in-process mesh for tests and single-host wiring
//

type LocalEnvelope = (MachineId, String, Vec<u8>);

/// Connects any number of in-process machines with the same channel
/// semantics as the UDP mesh, minus the crypto. Each joined machine gets a
/// pump task that invokes its handlers in send order.
#[derive(Default)]
pub struct LocalMeshHub {
    nodes: DashMap<MachineId, mpsc::UnboundedSender<LocalEnvelope>>,
}

impl LocalMeshHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>, machine: MachineId) -> LocalMesh {
        let (tx, mut rx) = mpsc::unbounded_channel::<LocalEnvelope>();
        let handlers: Arc<DashMap<String, ChannelHandler>> = Arc::new(DashMap::new());
        let pump_handlers = handlers.clone();
        let pump = tokio::spawn(async move {
            while let Some((from, channel, bytes)) = rx.recv().await {
                let handler = pump_handlers.get(&channel).map(|h| h.clone());
                if let Some(handler) = handler {
                    handler(from, bytes);
                }
            }
        });
        self.nodes.insert(machine.clone(), tx);
        LocalMesh {
            hub: self.clone(),
            machine,
            handlers,
            pump,
        }
    }
}

pub struct LocalMesh {
    hub: Arc<LocalMeshHub>,
    machine: MachineId,
    handlers: Arc<DashMap<String, ChannelHandler>>,
    pump: tokio::task::JoinHandle<()>,
}

impl Drop for LocalMesh {
    fn drop(&mut self) {
        self.hub.nodes.remove(&self.machine);
        self.pump.abort();
    }
}

#[async_trait::async_trait]
impl MeshProvider for LocalMesh {
    async fn send_on_channel(
        &self,
        to: &MachineId,
        channel: &str,
        bytes: Vec<u8>,
    ) -> Result<(), NetError> {
        if bytes.len() > MESSAGE_MAX_SIZE {
            return Err(NetError::Transport("message exceeds size cap".into()));
        }
        let node = self.hub.nodes.get(to).ok_or(NetError::NotConnected)?;
        node.send((self.machine.clone(), channel.to_string(), bytes))
            .map_err(|_| NetError::NotConnected)?;
        Ok(())
    }

    fn on_channel(&self, channel: &str, handler: ChannelHandler) {
        self.handlers.insert(channel.to_string(), handler);
    }

    fn off_channel(&self, channel: &str) {
        self.handlers.remove(channel);
    }

    fn local_machine(&self) -> MachineId {
        self.machine.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn udp_pair() -> (UdpMesh, UdpMesh, MachineId, MachineId) {
        let (print_tx, _rx) = mpsc::channel(64);
        let kp_a = Arc::new(IdentityKeypair::generate().unwrap());
        let kp_b = Arc::new(IdentityKeypair::generate().unwrap());
        let mesh_a = UdpMesh::new(kp_a.clone(), print_tx.clone());
        let mesh_b = UdpMesh::new(kp_b.clone(), print_tx);

        let sock_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sock_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr_a: Endpoint = sock_a.local_addr().unwrap().to_string().parse().unwrap();
        let addr_b: Endpoint = sock_b.local_addr().unwrap().to_string().parse().unwrap();

        let (ra, rb) = tokio::join!(
            mesh_a.connect_peer(sock_a, addr_b, true),
            mesh_b.connect_peer(sock_b, addr_a, false),
        );
        let id_b = ra.unwrap();
        let id_a = rb.unwrap();
        assert_eq!(id_a, kp_a.peer_id());
        assert_eq!(id_b, kp_b.peer_id());
        (mesh_a, mesh_b, id_a, id_b)
    }

    #[tokio::test]
    async fn udp_mesh_bidirectional_channels() {
        let (mesh_a, mesh_b, id_a, id_b) = udp_pair().await;

        let (got_b_tx, mut got_b_rx) = mpsc::unbounded_channel();
        mesh_b.on_channel(
            "tunnel-data",
            Arc::new(move |from, bytes| {
                let _ = got_b_tx.send((from, bytes));
            }),
        );
        let (got_a_tx, mut got_a_rx) = mpsc::unbounded_channel();
        mesh_a.on_channel(
            "tunnel-data",
            Arc::new(move |from, bytes| {
                let _ = got_a_tx.send((from, bytes));
            }),
        );

        mesh_a
            .send_on_channel(&id_b, "tunnel-data", b"hello b".to_vec())
            .await
            .unwrap();
        mesh_b
            .send_on_channel(&id_a, "tunnel-data", b"hello a".to_vec())
            .await
            .unwrap();

        let (from, bytes) = got_b_rx.recv().await.unwrap();
        assert_eq!((from, bytes), (id_a.clone(), b"hello b".to_vec()));
        let (from, bytes) = got_a_rx.recv().await.unwrap();
        assert_eq!((from, bytes), (id_b.clone(), b"hello a".to_vec()));
    }

    #[tokio::test]
    async fn udp_mesh_orders_within_channel() {
        let (mesh_a, mesh_b, _id_a, id_b) = udp_pair().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        mesh_b.on_channel(
            "tunnel-traffic",
            Arc::new(move |_from, bytes| {
                let _ = tx.send(bytes);
            }),
        );
        for i in 0u32..100 {
            mesh_a
                .send_on_channel(&id_b, "tunnel-traffic", i.to_be_bytes().to_vec())
                .await
                .unwrap();
        }
        for i in 0u32..100 {
            assert_eq!(rx.recv().await.unwrap(), i.to_be_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn udp_mesh_fragments_large_messages() {
        let (mesh_a, mesh_b, _id_a, id_b) = udp_pair().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        mesh_b.on_channel(
            "tunnel-data",
            Arc::new(move |_from, bytes| {
                let _ = tx.send(bytes);
            }),
        );
        let big: Vec<u8> = (0..(FRAGMENT_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        mesh_a
            .send_on_channel(&id_b, "tunnel-data", big.clone())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), big);
    }

    #[tokio::test]
    async fn udp_mesh_send_to_unknown_peer_fails() {
        let (print_tx, _rx) = mpsc::channel(8);
        let mesh = UdpMesh::new(Arc::new(IdentityKeypair::generate().unwrap()), print_tx);
        let result = mesh
            .send_on_channel(&"nobody".to_string(), "tunnel-data", vec![1])
            .await;
        assert!(matches!(result, Err(NetError::NotConnected)));
    }

    #[tokio::test]
    async fn local_mesh_channels_and_replacement() {
        let hub = LocalMeshHub::new();
        let mesh_a = hub.join("machine-a".into());
        let mesh_b = hub.join("machine-b".into());

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        mesh_b.on_channel(
            "tunnel-data",
            Arc::new(move |from, bytes| {
                let _ = tx1.send((from, bytes));
            }),
        );
        mesh_a
            .send_on_channel(&"machine-b".to_string(), "tunnel-data", b"one".to_vec())
            .await
            .unwrap();
        assert_eq!(rx1.recv().await.unwrap().1, b"one");

        // replacing the handler reroutes delivery atomically
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        mesh_b.on_channel(
            "tunnel-data",
            Arc::new(move |_from, bytes| {
                let _ = tx2.send(bytes);
            }),
        );
        mesh_a
            .send_on_channel(&"machine-b".to_string(), "tunnel-data", b"two".to_vec())
            .await
            .unwrap();
        assert_eq!(rx2.recv().await.unwrap(), b"two");

        mesh_b.off_channel("tunnel-data");
        mesh_a
            .send_on_channel(&"machine-b".to_string(), "tunnel-data", b"void".to_vec())
            .await
            .unwrap();
        // deregistered channel: message discarded, sender unaffected
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn local_mesh_unknown_machine() {
        let hub = LocalMeshHub::new();
        let mesh = hub.join("only-one".into());
        let result = mesh
            .send_on_channel(&"ghost".to_string(), "tunnel-data", vec![])
            .await;
        assert!(matches!(result, Err(NetError::NotConnected)));
    }
}
