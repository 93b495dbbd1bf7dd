use crate::packet::Endpoint;
use crate::types::NetError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// `[ 4 bytes session token ][ 4 bytes payload length BE ][ payload ]`
pub const RELAY_HEADER_LEN: usize = 8;

pub fn encapsulate(token: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RELAY_HEADER_LEN + payload.len());
    buf.extend_from_slice(&token.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Reject short datagrams and foreign tokens; take exactly `length` bytes.
pub fn decapsulate(token: u32, datagram: &[u8]) -> Option<Vec<u8>> {
    if datagram.len() < RELAY_HEADER_LEN {
        return None;
    }
    let observed = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    if observed != token {
        return None;
    }
    let length = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]) as usize;
    datagram
        .get(RELAY_HEADER_LEN..RELAY_HEADER_LEN + length)
        .map(|payload| payload.to_vec())
}

/// Fallback transport when both peers are behind symmetric NAT: every
/// datagram is token-prefixed and bounced off the rendezvous-assigned relay,
/// which forwards between the two session holders. Bit-exact for arbitrary
/// payloads up to the UDP maximum.
pub struct RelayClient {
    socket: Arc<UdpSocket>,
    relay: Endpoint,
    token: u32,
    rejected: AtomicU64,
}

impl RelayClient {
    pub fn new(socket: Arc<UdpSocket>, relay: Endpoint, token: u32) -> Self {
        RelayClient {
            socket,
            relay,
            token,
            rejected: AtomicU64::new(0),
        }
    }

    pub fn relay_endpoint(&self) -> Endpoint {
        self.relay
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), NetError> {
        self.socket
            .send_to(&encapsulate(self.token, payload), self.relay.to_socket_addr())
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Receive the next payload forwarded through the relay. Datagrams from
    /// other sources, foreign tokens, and truncated frames are counted and
    /// skipped.
    pub async fn recv(&self) -> Result<Vec<u8>, NetError> {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| NetError::Transport(e.to_string()))?;
            if from != self.relay.to_socket_addr() {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match decapsulate(self.token, &buf[..len]) {
                Some(payload) => return Ok(payload),
                None => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
