use crate::filter::{Decision, EndpointAllowlist, FilterStrategy};
use crate::packet::Ipv4Packet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Check every packet against the allowlist. The slowest and strictest mode:
/// a packet is forwarded iff its `(dstAddr, dstPort)` is currently allowed.
pub struct FullFilterStrategy {
    allowlist: EndpointAllowlist,
    packets_checked: AtomicU64,
    packets_forwarded: AtomicU64,
    packets_dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FullFilterStats {
    pub packets_checked: u64,
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
}

impl FullFilterStrategy {
    pub fn new(allowlist: EndpointAllowlist) -> Self {
        FullFilterStrategy {
            allowlist,
            packets_checked: AtomicU64::new(0),
            packets_forwarded: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> FullFilterStats {
        FullFilterStats {
            packets_checked: self.packets_checked.load(Ordering::Relaxed),
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }
}

impl FilterStrategy for FullFilterStrategy {
    fn should_forward(&self, packet: &Ipv4Packet) -> Decision {
        self.packets_checked.fetch_add(1, Ordering::Relaxed);
        let Some(destination) = packet.destination_endpoint() else {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return Decision::Drop("no destination port".into());
        };
        if self.allowlist.contains(&destination) {
            self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
            Decision::Forward
        } else {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            Decision::Drop(format!("destination {destination} not allowed"))
        }
    }

    fn name(&self) -> &'static str {
        "full"
    }

    fn describe(&self) -> String {
        let stats = self.stats();
        format!(
            "filter(full): checked {} forwarded {} dropped {}",
            stats.packets_checked, stats.packets_forwarded, stats.packets_dropped
        )
    }
}
