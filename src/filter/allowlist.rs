use crate::packet::Endpoint;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// The set of `(addr, port)` destinations a guest workload may reach.
/// Deny-by-default: an empty allowlist blocks everything. Shared between the
/// filtering strategy on the packet path and the session that mutates it, so
/// every operation is a single atomic map op.
#[derive(Clone, Default)]
pub struct EndpointAllowlist(Arc<DashMap<Endpoint, ()>>);

impl EndpointAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_allowed(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.0.contains_key(&Endpoint::new(addr, port))
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.0.contains_key(endpoint)
    }

    pub fn add(&self, endpoint: Endpoint) {
        self.0.insert(endpoint, ());
    }

    pub fn remove(&self, endpoint: &Endpoint) {
        self.0.remove(endpoint);
    }

    /// Replace the whole set.
    pub fn set_allowed(&self, endpoints: HashSet<Endpoint>) {
        self.0.retain(|e, _| endpoints.contains(e));
        for e in endpoints {
            self.0.insert(e, ());
        }
    }

    pub fn clear(&self) {
        self.0.clear();
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    #[test]
    fn empty_blocks_all() {
        let list = EndpointAllowlist::new();
        assert!(list.is_empty());
        assert!(!list.is_allowed(Ipv4Addr::new(8, 8, 8, 8), 53));
        assert!(!list.is_allowed(Ipv4Addr::new(0, 0, 0, 0), 0));
    }

    #[test]
    fn membership_ops() {
        let list = EndpointAllowlist::new();
        list.add(ep("203.0.113.50:51900"));
        assert!(list.contains(&ep("203.0.113.50:51900")));
        assert!(list.is_allowed(Ipv4Addr::new(203, 0, 113, 50), 51900));
        // same address, different port is a different endpoint
        assert!(!list.is_allowed(Ipv4Addr::new(203, 0, 113, 50), 51901));
        assert_eq!(list.count(), 1);
        list.remove(&ep("203.0.113.50:51900"));
        assert!(list.is_empty());
    }

    #[test]
    fn set_allowed_replaces() {
        let list = EndpointAllowlist::new();
        list.add(ep("1.1.1.1:1"));
        list.set_allowed([ep("2.2.2.2:2"), ep("3.3.3.3:3")].into_iter().collect());
        assert!(!list.contains(&ep("1.1.1.1:1")));
        assert!(list.contains(&ep("2.2.2.2:2")));
        assert_eq!(list.count(), 2);
        list.clear();
        assert!(list.is_empty());
    }
}
