use crate::packet::Endpoint;
use crate::types::NetError;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// 8-byte probe tag; everything else on the socket is ignored during a punch.
pub const PROBE_MAGIC: &[u8; 8] = b"OMERTAHP";
const PROBE_LEN: usize = 8 + 12;

/// Which side opens first. Assigned per-side by the rendezvous from the NAT
/// class pair; `YouInitiate` on one side always pairs with `PeerInitiates`
/// on the other.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HolePunchStrategy {
    Simultaneous,
    YouInitiate,
    PeerInitiates,
    Relay,
}

#[derive(Clone, Copy, Debug)]
pub struct HolePunchConfig {
    pub interval: Duration,
    pub deadline: Duration,
    pub fallback_to_relay: bool,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        HolePunchConfig {
            interval: Duration::from_millis(200),
            deadline: Duration::from_secs(5),
            fallback_to_relay: true,
        }
    }
}

/// A successful punch. `endpoint` is the source we actually observed the
/// peer's probe from, which may differ from the endpoint the rendezvous
/// reported when the peer's NAT walks ports or rebinds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HolePunchOutcome {
    pub endpoint: Endpoint,
    pub rtt: Duration,
}

pub fn build_probe() -> Vec<u8> {
    let mut txid = [0u8; 12];
    SystemRandom::new().fill(&mut txid).expect("system rng failed");
    let mut buf = Vec::with_capacity(PROBE_LEN);
    buf.extend_from_slice(PROBE_MAGIC);
    buf.extend_from_slice(&txid);
    buf
}

pub fn is_probe(buf: &[u8]) -> bool {
    buf.len() >= PROBE_LEN && &buf[..8] == PROBE_MAGIC
}

/// Run one hole-punch attempt on the given socket. Bidirectional probing:
/// send at a fixed interval (unless told to wait for the peer's first
/// probe), stop on the first probe received, answer it once so the peer
/// stops too. The socket is left open for the mesh transport on success.
pub async fn punch(
    socket: &UdpSocket,
    expected_peer: Endpoint,
    strategy: HolePunchStrategy,
    config: HolePunchConfig,
) -> Result<HolePunchOutcome, NetError> {
    if strategy == HolePunchStrategy::Relay {
        return Err(NetError::BothSymmetric);
    }

    let started = Instant::now();
    let probe = build_probe();
    let mut buf = [0u8; 2048];
    // the waiting side sends nothing until it has observed the peer
    let mut observed_peer: Option<Endpoint> = None;
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if started.elapsed() > config.deadline {
            return Err(NetError::Timeout);
        }
        tokio::select! {
            _ = interval.tick() => {
                let target = match (strategy, observed_peer) {
                    (HolePunchStrategy::PeerInitiates, None) => continue,
                    (_, Some(observed)) => observed,
                    (_, None) => expected_peer,
                };
                socket
                    .send_to(&probe, target.to_socket_addr())
                    .await
                    .map_err(|e| NetError::Transport(e.to_string()))?;
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, from) = recv.map_err(|e| NetError::Transport(e.to_string()))?;
                let SocketAddr::V4(from) = from else { continue };
                if !is_probe(&buf[..len]) {
                    continue;
                }
                let actual = Endpoint::from(from);
                if observed_peer.is_none() {
                    observed_peer = Some(actual);
                    // answer once so the peer sees traffic from us and stops
                    socket
                        .send_to(&probe, actual.to_socket_addr())
                        .await
                        .map_err(|e| NetError::Transport(e.to_string()))?;
                }
                return Ok(HolePunchOutcome {
                    endpoint: actual,
                    rtt: started.elapsed(),
                });
            }
            _ = tokio::time::sleep(config.deadline.saturating_sub(started.elapsed())) => {
                return Err(NetError::Timeout);
            }
        }
    }
}
