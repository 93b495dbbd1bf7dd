use crate::identity::IdentityKeypair;
use crate::packet::Endpoint;
use crate::types::{print, NetError, PrintSender};
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

pub mod routing;
pub mod types;

pub use routing::{DhtKey, DhtNodeInfo, KBucket, RoutingTable, K};
pub use types::{DhtMessage, DhtPacket, PeerAnnouncement};

use routing::{dht_key, xor_distance};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// lookup parallelism
const ALPHA: usize = 3;

/// A Kademlia node: one UDP socket, a routing table fed by every packet
/// observed, and a store of signed peer announcements. Peer lookup through
/// the DHT is independent of the rendezvous path; the two coexist.
pub struct DhtNode {
    inner: Arc<DhtInner>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

struct DhtInner {
    keypair: Arc<IdentityKeypair>,
    socket: UdpSocket,
    local_port: u16,
    routing: Mutex<RoutingTable>,
    storage: DashMap<DhtKey, PeerAnnouncement>,
    pending: DashMap<u64, oneshot::Sender<DhtMessage>>,
    print_tx: PrintSender,
}

impl DhtInner {
    fn local_info(&self) -> DhtNodeInfo {
        DhtNodeInfo {
            peer_id: self.keypair.peer_id(),
            address: std::net::Ipv4Addr::new(0, 0, 0, 0),
            port: self.local_port,
            last_seen: 0,
        }
    }

    fn learn(&self, mut sender: DhtNodeInfo, observed: SocketAddr) {
        if sender.peer_id == self.keypair.peer_id() {
            return;
        }
        // trust the observed source address over whatever the sender claims
        if let SocketAddr::V4(v4) = observed {
            sender.address = *v4.ip();
            sender.port = v4.port();
        }
        sender.last_seen = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before epoch")
            .as_secs();
        // a full bucket keeps its oldest member; the candidate is dropped
        // here and stale entries fall out via request timeouts instead
        let _evict_candidate = self
            .routing
            .lock()
            .expect("routing lock poisoned")
            .add_or_update(sender);
    }

    async fn send_packet(&self, packet: &DhtPacket, to: SocketAddr) -> Result<(), NetError> {
        self.socket
            .send_to(&packet.encode(), to)
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
        Ok(())
    }

    /// One RPC: send, wait for the matching response or time out. A response
    /// arriving after the deadline finds no waiter and is dropped.
    async fn request(&self, to: SocketAddr, message: DhtMessage) -> Result<DhtMessage, NetError> {
        let packet = DhtPacket::request(self.local_info(), message);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(packet.transaction_id, tx);
        if let Err(e) = self.send_packet(&packet, to).await {
            self.pending.remove(&packet.transaction_id);
            return Err(e);
        }
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(NetError::Transport("dht node stopped".into())),
            Err(_) => {
                self.pending.remove(&packet.transaction_id);
                Err(NetError::Timeout)
            }
        }
    }

    fn handle_request(&self, message: DhtMessage) -> Option<DhtMessage> {
        match message {
            DhtMessage::Ping => Some(DhtMessage::Pong),
            DhtMessage::FindNode { target } => {
                let nodes = self
                    .routing
                    .lock()
                    .expect("routing lock poisoned")
                    .closest_nodes(&target, K);
                Some(DhtMessage::FoundNodes { nodes })
            }
            DhtMessage::Store { announcement } => {
                if !announcement.verify() || announcement.expired() {
                    // unverifiable stores get no acknowledgement at all
                    return None;
                }
                self.storage.insert(announcement.dht_key(), announcement);
                Some(DhtMessage::Pong)
            }
            DhtMessage::FindValue { key } => match self.storage.get(&key) {
                Some(announcement) if !announcement.expired() => Some(DhtMessage::Value {
                    announcement: announcement.clone(),
                }),
                _ => {
                    let closest = self
                        .routing
                        .lock()
                        .expect("routing lock poisoned")
                        .closest_nodes(&key, K);
                    Some(DhtMessage::NotFound { closest })
                }
            },
            // responses that reach here had no waiter; nothing to do
            _ => None,
        }
    }
}

impl DhtNode {
    pub async fn bind(
        bind_addr: &str,
        keypair: Arc<IdentityKeypair>,
        print_tx: PrintSender,
    ) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        let local_port = socket
            .local_addr()
            .map_err(|e| NetError::BindFailed(e.to_string()))?
            .port();
        let local_key = dht_key(keypair.peer_id().as_bytes());
        let inner = Arc::new(DhtInner {
            keypair,
            socket,
            local_port,
            routing: Mutex::new(RoutingTable::new(local_key)),
            storage: DashMap::new(),
            pending: DashMap::new(),
            print_tx,
        });

        let recv_inner = inner.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let Ok((len, from)) = recv_inner.socket.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(packet) = DhtPacket::decode(&buf[..len]) else {
                    // malformed datagrams are dropped, never surfaced
                    continue;
                };
                recv_inner.learn(packet.sender.clone(), from);
                if packet.message.is_response() {
                    if let Some((_, waiter)) = recv_inner.pending.remove(&packet.transaction_id) {
                        let _ = waiter.send(packet.message);
                    }
                } else if let Some(reply) = recv_inner.handle_request(packet.message) {
                    let reply =
                        DhtPacket::response(packet.transaction_id, recv_inner.local_info(), reply);
                    if recv_inner.send_packet(&reply, from).await.is_err() {
                        break;
                    }
                }
            }
        });

        let refresh_inner = inner.clone();
        let refresh_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(REFRESH_INTERVAL).await;
                let before = refresh_inner.storage.len();
                refresh_inner.storage.retain(|_, a| !a.expired());
                let evicted = before - refresh_inner.storage.len();
                if evicted > 0 {
                    print(
                        &refresh_inner.print_tx,
                        1,
                        format!("dht: evicted {evicted} expired announcements"),
                    )
                    .await;
                }
            }
        });

        Ok(DhtNode {
            inner,
            tasks: Mutex::new(vec![recv_task, refresh_task]),
        })
    }

    pub fn peer_id(&self) -> String {
        self.inner.keypair.peer_id()
    }

    pub fn port(&self) -> u16 {
        self.inner.local_port
    }

    pub fn node_info(&self) -> DhtNodeInfo {
        let mut info = self.inner.local_info();
        info.address = std::net::Ipv4Addr::new(127, 0, 0, 1);
        info
    }

    pub fn routing_contains(&self, peer_id: &str) -> bool {
        self.inner
            .routing
            .lock()
            .expect("routing lock poisoned")
            .contains(peer_id)
    }

    pub fn routing_len(&self) -> usize {
        self.inner.routing.lock().expect("routing lock poisoned").len()
    }

    /// Liveness check. On timeout the peer is dropped from the table, which
    /// is what makes room for fresher nodes in its bucket.
    pub async fn ping(&self, node: &DhtNodeInfo) -> bool {
        match self
            .inner
            .request(node.endpoint().to_socket_addr(), DhtMessage::Ping)
            .await
        {
            Ok(DhtMessage::Pong) => true,
            _ => {
                self.inner
                    .routing
                    .lock()
                    .expect("routing lock poisoned")
                    .remove(&node.peer_id);
                false
            }
        }
    }

    pub async fn find_node(&self, via: Endpoint, target: DhtKey) -> Vec<DhtNodeInfo> {
        match self
            .inner
            .request(via.to_socket_addr(), DhtMessage::FindNode { target })
            .await
        {
            Ok(DhtMessage::FoundNodes { nodes }) => nodes,
            _ => Vec::new(),
        }
    }

    /// Push an announcement to one node. Callers verify before sending; the
    /// remote silently ignores anything that fails verification.
    pub async fn store(
        &self,
        via: Endpoint,
        announcement: PeerAnnouncement,
    ) -> Result<(), NetError> {
        if !announcement.verify() {
            return Err(NetError::SignatureInvalid);
        }
        match self
            .inner
            .request(via.to_socket_addr(), DhtMessage::Store { announcement })
            .await?
        {
            DhtMessage::Pong => Ok(()),
            _ => Err(NetError::Transport("unexpected store reply".into())),
        }
    }

    /// Iterative lookup: query the α closest known nodes, fold their
    /// answers back in, stop when a verified value appears or no round
    /// makes progress.
    pub async fn find_value(&self, key: DhtKey) -> Option<PeerAnnouncement> {
        if let Some(stored) = self.inner.storage.get(&key) {
            if !stored.expired() {
                return Some(stored.clone());
            }
        }
        let mut candidates = self
            .inner
            .routing
            .lock()
            .expect("routing lock poisoned")
            .closest_nodes(&key, K);
        let mut queried: HashSet<String> = HashSet::new();

        loop {
            let round: Vec<DhtNodeInfo> = candidates
                .iter()
                .filter(|n| !queried.contains(&n.peer_id))
                .take(ALPHA)
                .cloned()
                .collect();
            if round.is_empty() {
                return None;
            }
            for node in round {
                queried.insert(node.peer_id.clone());
                match self
                    .inner
                    .request(node.endpoint().to_socket_addr(), DhtMessage::FindValue { key })
                    .await
                {
                    Ok(DhtMessage::Value { announcement }) => {
                        if announcement.verify() && !announcement.expired() {
                            return Some(announcement);
                        }
                    }
                    Ok(DhtMessage::NotFound { closest }) => {
                        for candidate in closest {
                            if candidate.peer_id != self.peer_id()
                                && !candidates.iter().any(|c| c.peer_id == candidate.peer_id)
                            {
                                candidates.push(candidate);
                            }
                        }
                        candidates.sort_by_key(|n| xor_distance(&n.key(), &key));
                    }
                    _ => {}
                }
            }
        }
    }

    /// Sign and place our own announcement on the k closest nodes we can
    /// reach, walking toward our own key.
    pub async fn announce(
        &self,
        capabilities: Vec<String>,
        signaling_addresses: Vec<String>,
        ttl: u64,
    ) -> usize {
        let announcement =
            PeerAnnouncement::signed(&self.inner.keypair, capabilities, signaling_addresses, ttl);
        let key = announcement.dht_key();
        self.inner.storage.insert(key, announcement.clone());

        let targets = self
            .inner
            .routing
            .lock()
            .expect("routing lock poisoned")
            .closest_nodes(&key, K);
        let mut stored = 0;
        for node in targets {
            if self.store(node.endpoint(), announcement.clone()).await.is_ok() {
                stored += 1;
            }
        }
        stored
    }

    /// Join an existing mesh through one known node.
    pub async fn bootstrap(&self, node: DhtNodeInfo) -> Result<(), NetError> {
        if !self.ping(&node).await {
            return Err(NetError::PeerUnreachable);
        }
        let own_key = dht_key(self.peer_id().as_bytes());
        let discovered = self.find_node(node.endpoint(), own_key).await;
        for found in discovered {
            if found.peer_id != self.peer_id() {
                self.inner
                    .routing
                    .lock()
                    .expect("routing lock poisoned")
                    .add_or_update(found);
            }
        }
        Ok(())
    }

    pub fn stored_announcements(&self) -> usize {
        self.inner.storage.len()
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
    }
}

impl Drop for DhtNode {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn test_node() -> DhtNode {
        let (print_tx, _rx) = mpsc::channel(64);
        let keypair = Arc::new(IdentityKeypair::generate().unwrap());
        DhtNode::bind("127.0.0.1:0", keypair, print_tx).await.unwrap()
    }

    #[tokio::test]
    async fn two_node_ping() {
        let n1 = test_node().await;
        let n2 = test_node().await;

        let ok = tokio::time::timeout(Duration::from_secs(5), n1.ping(&n2.node_info()))
            .await
            .unwrap();
        assert!(ok);
        assert!(n1.routing_contains(&n2.peer_id()));
        // seen twice (request + response) but recorded exactly once
        assert!(n1.ping(&n2.node_info()).await);
        assert_eq!(n1.routing_len(), 1);
        // the pinged side learned us from the request
        assert!(n2.routing_contains(&n1.peer_id()));
    }

    #[tokio::test]
    async fn ping_timeout_removes_node() {
        tokio::time::pause();
        let n1 = test_node().await;
        let ghost = DhtNodeInfo {
            peer_id: "ghost".into(),
            address: std::net::Ipv4Addr::new(127, 0, 0, 1),
            port: 1,
            last_seen: 0,
        };
        let ping = n1.ping(&ghost);
        tokio::pin!(ping);
        // drive past the request timeout under the paused clock
        assert!(!ping.await);
        assert!(!n1.routing_contains("ghost"));
    }

    #[tokio::test]
    async fn store_and_find_value_across_nodes() {
        let n1 = test_node().await;
        let n2 = test_node().await;
        let n3 = test_node().await;

        // n1 knows n2, n2 knows n3
        assert!(n1.ping(&n2.node_info()).await);
        assert!(n2.ping(&n3.node_info()).await);

        let keypair = IdentityKeypair::generate().unwrap();
        let announcement =
            PeerAnnouncement::signed(&keypair, vec![], vec!["203.0.113.9:4100".into()], 600);
        let key = announcement.dht_key();
        n1.store(n2.node_info().endpoint(), announcement.clone())
            .await
            .unwrap();
        assert_eq!(n2.stored_announcements(), 1);

        // n3 only knows n2, and n2 holds the value
        assert!(n3.ping(&n2.node_info()).await);
        let found = n3.find_value(key).await.unwrap();
        assert_eq!(found, announcement);
    }

    #[tokio::test]
    async fn store_rejects_bad_signature() {
        let n1 = test_node().await;
        let n2 = test_node().await;
        assert!(n1.ping(&n2.node_info()).await);

        let keypair = IdentityKeypair::generate().unwrap();
        let mut announcement = PeerAnnouncement::signed(&keypair, vec![], vec![], 600);
        announcement.capabilities = vec!["forged".into()];
        let result = n1.store(n2.node_info().endpoint(), announcement).await;
        assert!(matches!(result, Err(NetError::SignatureInvalid)));
        assert_eq!(n2.stored_announcements(), 0);
    }

    #[tokio::test]
    async fn announce_reaches_known_peers() {
        let n1 = test_node().await;
        let n2 = test_node().await;
        assert!(n1.ping(&n2.node_info()).await);

        let stored = n1.announce(vec!["compute".into()], vec!["1.2.3.4:1".into()], 600).await;
        assert_eq!(stored, 1);
        assert_eq!(n2.stored_announcements(), 1);
    }
}
