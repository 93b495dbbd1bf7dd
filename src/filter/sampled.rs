use crate::filter::{Decision, EndpointAllowlist, FilterStrategy};
use crate::packet::Ipv4Packet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Check a packet against the allowlist with probability `sample_rate`;
/// forward unchecked otherwise. One observed violation is enough to
/// Terminate. The sampler is seeded from OS entropy so a guest workload
/// cannot predict which packets will be inspected.
pub struct SampledStrategy {
    allowlist: EndpointAllowlist,
    sample_rate: f64,
    rng: Mutex<StdRng>,
    packets_checked: AtomicU64,
    packets_forwarded: AtomicU64,
    packets_terminated: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SampledStats {
    pub packets_checked: u64,
    pub packets_forwarded: u64,
    pub packets_terminated: u64,
}

impl SampledStrategy {
    pub fn new(allowlist: EndpointAllowlist, sample_rate: f64) -> Self {
        SampledStrategy {
            allowlist,
            sample_rate: sample_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::from_entropy()),
            packets_checked: AtomicU64::new(0),
            packets_forwarded: AtomicU64::new(0),
            packets_terminated: AtomicU64::new(0),
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn stats(&self) -> SampledStats {
        SampledStats {
            packets_checked: self.packets_checked.load(Ordering::Relaxed),
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            packets_terminated: self.packets_terminated.load(Ordering::Relaxed),
        }
    }

    fn sample(&self) -> bool {
        self.rng.lock().expect("sampler lock poisoned").gen::<f64>() < self.sample_rate
    }
}

impl FilterStrategy for SampledStrategy {
    fn should_forward(&self, packet: &Ipv4Packet) -> Decision {
        if !self.sample() {
            self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
            return Decision::Forward;
        }
        self.packets_checked.fetch_add(1, Ordering::Relaxed);
        let allowed = packet
            .destination_endpoint()
            .map(|destination| self.allowlist.contains(&destination))
            .unwrap_or(false);
        if allowed {
            self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
            Decision::Forward
        } else {
            self.packets_terminated.fetch_add(1, Ordering::Relaxed);
            Decision::Terminate(format!(
                "sampled packet to non-allowed destination {}",
                packet
                    .destination_endpoint()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| packet.destination_address.to_string())
            ))
        }
    }

    fn name(&self) -> &'static str {
        "sampled"
    }

    fn describe(&self) -> String {
        let stats = self.stats();
        format!(
            "filter(sampled, rate {}): checked {} forwarded {} terminated {}",
            self.sample_rate, stats.packets_checked, stats.packets_forwarded, stats.packets_terminated
        )
    }
}
