use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Bucket capacity.
pub const K: usize = 20;
/// 160-bit key space: SHA-1 of the peer id.
pub const KEY_LEN: usize = 20;
pub const NUM_BUCKETS: usize = KEY_LEN * 8;

pub type DhtKey = [u8; KEY_LEN];

/// SHA-1 keys cluster announcements next to the routing entries of their
/// authors; this is a key-space choice, not a security primitive.
pub fn dht_key(data: &[u8]) -> DhtKey {
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, data);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(digest.as_ref());
    key
}

pub fn xor_distance(a: &DhtKey, b: &DhtKey) -> DhtKey {
    let mut distance = [0u8; KEY_LEN];
    for i in 0..KEY_LEN {
        distance[i] = a[i] ^ b[i];
    }
    distance
}

/// Index of the highest set bit of the distance; None for the zero distance
/// (a node never routes to itself).
pub fn bucket_index(distance: &DhtKey) -> Option<usize> {
    for (byte_index, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let msb = 7 - byte.leading_zeros() as usize;
            return Some((KEY_LEN - 1 - byte_index) * 8 + msb);
        }
    }
    None
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DhtNodeInfo {
    pub peer_id: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub last_seen: u64,
}

impl DhtNodeInfo {
    pub fn key(&self) -> DhtKey {
        dht_key(self.peer_id.as_bytes())
    }

    pub fn endpoint(&self) -> crate::packet::Endpoint {
        crate::packet::Endpoint::new(self.address, self.port)
    }
}

/// At most k nodes ordered by recency, oldest first. Seeing a node again
/// moves it to the tail; a full bucket hands back its oldest entry as the
/// eviction candidate instead of accepting the newcomer.
#[derive(Clone, Debug, Default)]
pub struct KBucket {
    nodes: Vec<DhtNodeInfo>,
}

impl KBucket {
    pub fn add_or_update(&mut self, node: DhtNodeInfo) -> Option<DhtNodeInfo> {
        if let Some(position) = self.nodes.iter().position(|n| n.peer_id == node.peer_id) {
            self.nodes.remove(position);
            self.nodes.push(node);
            return None;
        }
        if self.nodes.len() < K {
            self.nodes.push(node);
            return None;
        }
        Some(self.nodes[0].clone())
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<DhtNodeInfo> {
        let position = self.nodes.iter().position(|n| n.peer_id == peer_id)?;
        Some(self.nodes.remove(position))
    }

    pub fn nodes(&self) -> &[DhtNodeInfo] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// 160 k-buckets indexed by the highest differing bit against the local key.
pub struct RoutingTable {
    local_key: DhtKey,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_key: DhtKey) -> Self {
        RoutingTable {
            local_key,
            buckets: vec![KBucket::default(); NUM_BUCKETS],
        }
    }

    pub fn local_key(&self) -> &DhtKey {
        &self.local_key
    }

    /// Record a live node. Returns the eviction candidate when the target
    /// bucket is full; callers decide whether to liveness-check it.
    pub fn add_or_update(&mut self, node: DhtNodeInfo) -> Option<DhtNodeInfo> {
        let index = bucket_index(&xor_distance(&self.local_key, &node.key()))?;
        self.buckets[index].add_or_update(node)
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<DhtNodeInfo> {
        let key = dht_key(peer_id.as_bytes());
        let index = bucket_index(&xor_distance(&self.local_key, &key))?;
        self.buckets[index].remove(peer_id)
    }

    /// Up to `count` known nodes closest to `target` by XOR distance.
    pub fn closest_nodes(&self, target: &DhtKey, count: usize) -> Vec<DhtNodeInfo> {
        let mut all: Vec<DhtNodeInfo> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes().iter().cloned())
            .collect();
        all.sort_by_key(|n| xor_distance(&n.key(), target));
        all.truncate(count);
        all
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        let key = dht_key(peer_id.as_bytes());
        match bucket_index(&xor_distance(&self.local_key, &key)) {
            Some(index) => self.buckets[index]
                .nodes()
                .iter()
                .any(|n| n.peer_id == peer_id),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(peer_id: &str) -> DhtNodeInfo {
        DhtNodeInfo {
            peer_id: peer_id.to_string(),
            address: Ipv4Addr::new(127, 0, 0, 1),
            port: 4000,
            last_seen: 0,
        }
    }

    #[test]
    fn xor_metric_basics() {
        let a = dht_key(b"a");
        let b = dht_key(b"b");
        assert_eq!(xor_distance(&a, &a), [0u8; KEY_LEN]);
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(bucket_index(&[0u8; KEY_LEN]), None);

        let mut distance = [0u8; KEY_LEN];
        distance[KEY_LEN - 1] = 1;
        assert_eq!(bucket_index(&distance), Some(0));
        distance = [0u8; KEY_LEN];
        distance[0] = 0x80;
        assert_eq!(bucket_index(&distance), Some(159));
    }

    #[test]
    fn bucket_recency_order() {
        let mut bucket = KBucket::default();
        assert!(bucket.add_or_update(node("n1")).is_none());
        assert!(bucket.add_or_update(node("n2")).is_none());
        // seen again: moves to the tail
        assert!(bucket.add_or_update(node("n1")).is_none());
        assert_eq!(bucket.nodes()[0].peer_id, "n2");
        assert_eq!(bucket.nodes()[1].peer_id, "n1");
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn full_bucket_returns_oldest() {
        let mut bucket = KBucket::default();
        for i in 0..K {
            assert!(bucket.add_or_update(node(&format!("n{i}"))).is_none());
        }
        let candidate = bucket.add_or_update(node("newcomer")).unwrap();
        assert_eq!(candidate.peer_id, "n0");
        assert_eq!(bucket.len(), K);
        assert!(!bucket.nodes().iter().any(|n| n.peer_id == "newcomer"));
    }

    #[test]
    fn table_ignores_self_and_finds_closest() {
        let local = dht_key(b"local");
        let mut table = RoutingTable::new(local);

        let mut me = node("local");
        me.peer_id = "local".into();
        assert!(table.add_or_update(me).is_none());
        assert!(table.is_empty());

        for i in 0..50 {
            table.add_or_update(node(&format!("peer-{i}")));
        }
        assert_eq!(table.len(), 50);

        let target = dht_key(b"peer-7");
        let closest = table.closest_nodes(&target, 3);
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].peer_id, "peer-7");
        // returned nodes are sorted by distance to the target
        let d0 = xor_distance(&closest[0].key(), &target);
        let d1 = xor_distance(&closest[1].key(), &target);
        assert!(d0 <= d1);
    }
}
