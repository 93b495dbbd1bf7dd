use crate::packet::Endpoint;
use crate::types::{NatType, NetError};
use ring::rand::{SecureRandom, SystemRandom};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

pub const MAGIC_COOKIE: u32 = 0x2112_a442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;
const HEADER_LEN: usize = 20;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Minimal RFC 5389 client: learn our reflexive `(addr, port)` as seen by a
/// public server, and classify the NAT in front of us by comparing mappings
/// across servers.
pub struct StunClient {
    timeout: Duration,
}

impl Default for StunClient {
    fn default() -> Self {
        StunClient {
            timeout: Duration::from_secs(2),
        }
    }
}

/// What `classify` learned. The reflexive endpoint is present whenever at
/// least one server answered.
#[derive(Clone, Debug)]
pub struct NatClassification {
    pub reflexive: Option<Endpoint>,
    pub nat_type: NatType,
}

impl StunClient {
    pub fn with_timeout(timeout: Duration) -> Self {
        StunClient { timeout }
    }

    /// One Binding Request / Response exchange over the given socket, with
    /// retries and doubling backoff. The socket keeps its local port so that
    /// repeated queries observe the same NAT mapping behavior.
    pub async fn discover(
        &self,
        socket: &UdpSocket,
        server: SocketAddr,
    ) -> Result<Endpoint, NetError> {
        let mut backoff = INITIAL_BACKOFF;
        for _attempt in 0..MAX_RETRIES {
            let (request, txid) = build_binding_request();
            socket
                .send_to(&request, server)
                .await
                .map_err(|e| NetError::Transport(e.to_string()))?;

            let mut buf = [0u8; 1024];
            match tokio::time::timeout(self.timeout, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) if from == server => {
                    if let Some(endpoint) = parse_binding_response(&buf[..len], &txid) {
                        return Ok(endpoint);
                    }
                }
                Ok(Ok(_)) | Ok(Err(_)) => {}
                Err(_) => {}
            }
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
        Err(NetError::Timeout)
    }

    /// Query every server from the same local port and compare mappings.
    /// Servers that never answer are skipped; no answers at all is Unknown.
    pub async fn classify(
        &self,
        socket: &UdpSocket,
        servers: &[SocketAddr],
    ) -> NatClassification {
        let mut mappings = Vec::new();
        for server in servers {
            if let Ok(endpoint) = self.discover(socket, *server).await {
                mappings.push(endpoint);
            }
        }
        NatClassification {
            reflexive: mappings.first().copied(),
            nat_type: classify_mappings(&mappings),
        }
    }
}

/// Compare reflexive mappings observed from one local socket:
/// a different public port per destination means the NAT mints per-flow
/// mappings (symmetric); identical mappings mean some cone variant. The
/// restricted-cone refinements need a reach-back probe, supplied separately
/// to `refine_cone` by callers that can arrange one.
pub fn classify_mappings(mappings: &[Endpoint]) -> NatType {
    match mappings {
        [] => NatType::Unknown,
        [first, rest @ ..] => {
            if rest.iter().all(|m| m == first) {
                if rest.is_empty() {
                    // one observation cannot separate cone from symmetric
                    NatType::Unknown
                } else {
                    NatType::FullCone
                }
            } else {
                NatType::Symmetric
            }
        }
    }
}

/// Refine a cone classification given reach-back observations:
/// `unsolicited` means an uncontacted source reached our mapping;
/// `from_contacted_addr` means a previously-contacted address (any port) did.
pub fn refine_cone(unsolicited: bool, from_contacted_addr: bool) -> NatType {
    if unsolicited {
        NatType::FullCone
    } else if from_contacted_addr {
        NatType::RestrictedCone
    } else {
        NatType::PortRestrictedCone
    }
}

pub fn build_binding_request() -> (Vec<u8>, [u8; 12]) {
    let mut txid = [0u8; 12];
    SystemRandom::new().fill(&mut txid).expect("system rng failed");
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes()); // no attributes
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(&txid);
    (buf, txid)
}

/// Walk attributes of a Binding Success Response until XOR-MAPPED-ADDRESS.
pub fn parse_binding_response(buf: &[u8], txid: &[u8; 12]) -> Option<Endpoint> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != BINDING_SUCCESS {
        return None;
    }
    if u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) != MAGIC_COOKIE {
        return None;
    }
    if &buf[8..20] != txid {
        return None;
    }
    let message_length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let body = buf.get(HEADER_LEN..HEADER_LEN + message_length)?;

    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value = body.get(offset + 4..offset + 4 + attr_len)?;
        if attr_type == ATTR_XOR_MAPPED_ADDRESS && attr_len >= 8 && value[1] == FAMILY_IPV4 {
            let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
            let addr =
                u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
            return Some(Endpoint::new(Ipv4Addr::from(addr), port));
        }
        // attribute values are padded to 4-byte boundaries
        offset += 4 + (attr_len + 3) / 4 * 4;
    }
    None
}

/// Encode a Binding Success Response carrying XOR-MAPPED-ADDRESS. The
/// traversal tests stand up local servers with this; it is also all a
/// rendezvous deployment needs to answer with.
pub fn build_binding_response(txid: &[u8; 12], mapped: Endpoint) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 12);
    buf.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    buf.extend_from_slice(&12u16.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(txid);
    buf.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    buf.extend_from_slice(&8u16.to_be_bytes());
    buf.push(0);
    buf.push(FAMILY_IPV4);
    let xport = mapped.port ^ (MAGIC_COOKIE >> 16) as u16;
    buf.extend_from_slice(&xport.to_be_bytes());
    let xaddr = u32::from(mapped.addr) ^ MAGIC_COOKIE;
    buf.extend_from_slice(&xaddr.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    #[test]
    fn response_roundtrip() {
        let (_request, txid) = build_binding_request();
        let mapped = ep("198.51.100.7:61234");
        let response = build_binding_response(&txid, mapped);
        assert_eq!(parse_binding_response(&response, &txid), Some(mapped));
    }

    #[test]
    fn rejects_wrong_txid_and_cookie() {
        let (_request, txid) = build_binding_request();
        let response = build_binding_response(&txid, ep("198.51.100.7:61234"));
        let mut other_txid = txid;
        other_txid[0] ^= 1;
        assert_eq!(parse_binding_response(&response, &other_txid), None);

        let mut bad_cookie = response.clone();
        bad_cookie[4] ^= 0xff;
        assert_eq!(parse_binding_response(&bad_cookie, &txid), None);
    }

    #[test]
    fn classification() {
        assert_eq!(classify_mappings(&[]), NatType::Unknown);
        assert_eq!(classify_mappings(&[ep("1.2.3.4:1000")]), NatType::Unknown);
        assert_eq!(
            classify_mappings(&[ep("1.2.3.4:1000"), ep("1.2.3.4:1000")]),
            NatType::FullCone
        );
        assert_eq!(
            classify_mappings(&[ep("1.2.3.4:1000"), ep("1.2.3.4:1001")]),
            NatType::Symmetric
        );
        assert_eq!(refine_cone(false, true), NatType::RestrictedCone);
        assert_eq!(refine_cone(false, false), NatType::PortRestrictedCone);
    }

    #[tokio::test]
    async fn discover_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let mut txid = [0u8; 12];
            txid.copy_from_slice(&buf[8..20]);
            assert_eq!(len, 20);
            let mapped = match from {
                SocketAddr::V4(v4) => Endpoint::from(v4),
                _ => panic!("ipv4 only"),
            };
            let response = build_binding_response(&txid, mapped);
            server.send_to(&response, from).await.unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_port = socket.local_addr().unwrap().port();
        let client = StunClient::default();
        let mapping = client.discover(&socket, server_addr).await.unwrap();
        assert_eq!(mapping.port, local_port);
    }

    #[tokio::test]
    async fn discover_times_out_without_server() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = StunClient::with_timeout(Duration::from_millis(50));
        let result = client
            .discover(&socket, "127.0.0.1:9".parse().unwrap())
            .await;
        assert!(matches!(result, Err(NetError::Timeout)));
    }
}
