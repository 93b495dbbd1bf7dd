use crate::filter::{Decision, EndpointAllowlist, FilterStrategy};
use crate::packet::Ipv4Packet;
use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(300);

struct FlowEntry {
    allowed: bool,
    last_seen: Instant,
}

/// Consult the allowlist once per flow, then take the fast path. A flow is
/// `(dstAddr, dstPort)`; entries expire after the flow timeout and are
/// re-evaluated on next sight.
///
/// A cached "not allowed" entry escalates repeat hits to Terminate: a guest
/// still emitting packets at a destination it was already refused is actively
/// probing prohibited space.
pub struct ConntrackStrategy {
    allowlist: EndpointAllowlist,
    flows: DashMap<(Ipv4Addr, u16), FlowEntry>,
    flow_timeout: Duration,
    packets_processed: AtomicU64,
    allowlist_checks: AtomicU64,
    fast_path_hits: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConntrackStats {
    pub packets_processed: u64,
    pub allowlist_checks: u64,
    pub fast_path_hits: u64,
    pub tracked_flows: usize,
}

impl ConntrackStrategy {
    pub fn new(allowlist: EndpointAllowlist) -> Self {
        Self::with_flow_timeout(allowlist, DEFAULT_FLOW_TIMEOUT)
    }

    pub fn with_flow_timeout(allowlist: EndpointAllowlist, flow_timeout: Duration) -> Self {
        ConntrackStrategy {
            allowlist,
            flows: DashMap::new(),
            flow_timeout,
            packets_processed: AtomicU64::new(0),
            allowlist_checks: AtomicU64::new(0),
            fast_path_hits: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ConntrackStats {
        ConntrackStats {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            allowlist_checks: self.allowlist_checks.load(Ordering::Relaxed),
            fast_path_hits: self.fast_path_hits.load(Ordering::Relaxed),
            tracked_flows: self.flows.len(),
        }
    }

    /// Drop expired flow entries. The packet path also expires lazily on hit;
    /// this sweep keeps the table from accumulating dead flows.
    pub fn purge_expired(&self) {
        let timeout = self.flow_timeout;
        self.flows.retain(|_, entry| entry.last_seen.elapsed() < timeout);
    }

    fn check_allowlist(&self, key: (Ipv4Addr, u16)) -> bool {
        self.allowlist_checks.fetch_add(1, Ordering::Relaxed);
        let allowed = self.allowlist.is_allowed(key.0, key.1);
        self.flows.insert(
            key,
            FlowEntry {
                allowed,
                last_seen: Instant::now(),
            },
        );
        allowed
    }
}

impl FilterStrategy for ConntrackStrategy {
    fn should_forward(&self, packet: &Ipv4Packet) -> Decision {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
        let Some(destination) = packet.destination_endpoint() else {
            return Decision::Drop("no destination port".into());
        };
        let key = (destination.addr, destination.port);

        let cached = match self.flows.get_mut(&key) {
            Some(mut entry) if entry.last_seen.elapsed() < self.flow_timeout => {
                entry.last_seen = Instant::now();
                Some(entry.allowed)
            }
            Some(_) => {
                // expired, fall through to a fresh check
                None
            }
            None => None,
        };

        let (allowed, fast_path) = match cached {
            Some(allowed) => {
                self.fast_path_hits.fetch_add(1, Ordering::Relaxed);
                (allowed, true)
            }
            None => (self.check_allowlist(key), false),
        };

        if allowed {
            Decision::Forward
        } else if fast_path {
            Decision::Terminate(format!("repeated traffic to non-allowed {destination}"))
        } else {
            Decision::Terminate(format!("non-allowed destination {destination}"))
        }
    }

    fn name(&self) -> &'static str {
        "conntrack"
    }

    fn describe(&self) -> String {
        let stats = self.stats();
        format!(
            "filter(conntrack): processed {} checks {} fast-path {} flows {}",
            stats.packets_processed,
            stats.allowlist_checks,
            stats.fast_path_hits,
            stats.tracked_flows
        )
    }
}
