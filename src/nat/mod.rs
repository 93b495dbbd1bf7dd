pub mod holepunch;
pub mod stun;

pub use holepunch::{punch, HolePunchConfig, HolePunchOutcome, HolePunchStrategy};
pub use stun::{NatClassification, StunClient};

use crate::types::NatType;

/// Pick this side's hole-punch strategy from the pair of NAT classes.
/// Cone mappings are stable per-socket, so two cones can open simultaneously.
/// A symmetric NAT mints a fresh mapping per destination, so the symmetric
/// side must send first and the cone side answers whatever source it
/// observes. Two symmetric NATs cannot meet in the middle at all.
pub fn strategy_for(local: NatType, remote: NatType) -> HolePunchStrategy {
    use NatType::*;
    match (local, remote) {
        (Symmetric, Symmetric) => HolePunchStrategy::Relay,
        (Symmetric, _) => HolePunchStrategy::YouInitiate,
        (_, Symmetric) => HolePunchStrategy::PeerInitiates,
        (Unknown, _) | (_, Unknown) => HolePunchStrategy::Simultaneous,
        _ => HolePunchStrategy::Simultaneous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NatType::*;

    #[test]
    fn strategy_table() {
        assert_eq!(strategy_for(FullCone, PortRestrictedCone), HolePunchStrategy::Simultaneous);
        assert_eq!(strategy_for(RestrictedCone, FullCone), HolePunchStrategy::Simultaneous);
        assert_eq!(strategy_for(Symmetric, FullCone), HolePunchStrategy::YouInitiate);
        assert_eq!(strategy_for(FullCone, Symmetric), HolePunchStrategy::PeerInitiates);
        assert_eq!(strategy_for(Symmetric, Symmetric), HolePunchStrategy::Relay);
    }

    #[test]
    fn strategies_pair_up() {
        // whatever one side is told, the other side's strategy must mesh
        for a in [FullCone, RestrictedCone, PortRestrictedCone, Symmetric] {
            for b in [FullCone, RestrictedCone, PortRestrictedCone, Symmetric] {
                let ours = strategy_for(a, b);
                let theirs = strategy_for(b, a);
                match ours {
                    HolePunchStrategy::YouInitiate => {
                        assert_eq!(theirs, HolePunchStrategy::PeerInitiates)
                    }
                    HolePunchStrategy::PeerInitiates => {
                        assert_eq!(theirs, HolePunchStrategy::YouInitiate)
                    }
                    HolePunchStrategy::Simultaneous => {
                        assert_eq!(theirs, HolePunchStrategy::Simultaneous)
                    }
                    HolePunchStrategy::Relay => assert_eq!(theirs, HolePunchStrategy::Relay),
                }
            }
        }
    }
}
