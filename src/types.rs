use crate::packet::Endpoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

//
// internal message pipes between runtime components
//

pub type PrintSender = tokio::sync::mpsc::Sender<Printout>;
pub type PrintReceiver = tokio::sync::mpsc::Receiver<Printout>;

/// The mesh-layer identifier used for channel addressing. One-to-one with a
/// peer identity: it is the hex peerId derived from the signing public key.
pub type MachineId = String;

/// A diagnostic line emitted by a runtime component. Verbosity 0 is always
/// shown by embedders; higher levels are debug detail.
#[derive(Clone, Debug)]
pub struct Printout {
    pub verbosity: u8,
    pub content: String,
}

pub async fn print(print_tx: &PrintSender, verbosity: u8, content: String) {
    let _ = print_tx.send(Printout { verbosity, content }).await;
}

//
// NAT traversal
//

/// RFC 3489 NAT classes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NatType {
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    Unknown,
}

impl NatType {
    /// Cone NATs keep one mapping per local socket regardless of destination.
    pub fn is_cone(&self) -> bool {
        matches!(
            self,
            NatType::FullCone | NatType::RestrictedCone | NatType::PortRestrictedCone
        )
    }
}

/// How a peer connection was ultimately established.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConnectionType {
    Direct,
    HolePunched,
    Relayed { relay: Endpoint },
}

impl ConnectionType {
    pub fn is_relayed(&self) -> bool {
        matches!(self, ConnectionType::Relayed { .. })
    }

    /// Method preference: direct beats hole-punched beats relayed.
    pub fn precedence(&self) -> u8 {
        match self {
            ConnectionType::Direct => 0,
            ConnectionType::HolePunched => 1,
            ConnectionType::Relayed { .. } => 2,
        }
    }
}

/// Result of P2P setup for one peer.
#[derive(Clone, Debug)]
pub struct PeerConnection {
    pub peer_id: MachineId,
    pub endpoint: Endpoint,
    pub connection_type: ConnectionType,
    pub rtt: std::time::Duration,
    pub nat_type: NatType,
}

/// Our own reflexive address as discovered at startup.
#[derive(Clone, Debug)]
pub struct PublicEndpoint {
    pub addr: std::net::Ipv4Addr,
    pub port: u16,
    pub nat_type: NatType,
}

//
// VM attachment contract (consumed from the scheduler side)
//

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// guest <-> host NAT, no inspection
    Direct,
    /// probabilistic per-packet checks
    Sampled,
    /// first-packet-of-flow checks
    Conntrack,
    /// every packet checked
    Filtered,
}

impl NetworkMode {
    pub fn is_filtering(&self) -> bool {
        !matches!(self, NetworkMode::Direct)
    }
}

/// Binding of a VM to a tunnel session, handed to the core by the scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmNetworkConfig {
    pub vm_id: String,
    pub mode: NetworkMode,
    pub consumer_endpoint: Option<Endpoint>,
    pub sampling_rate: Option<f64>,
}

//
// job contract exposed to the scheduler
//

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSubmission {
    pub job_id: String,
    pub consumer: MachineId,
    pub image: String,
    pub args: Vec<String>,
    pub network: VmNetworkConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ExecutionResult {
    Success { job_id: String, output: Vec<u8> },
    Failure { job_id: String, reason: FailureReason },
}

/// The only failure classes a job submitter sees.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    ResourceDenied,
    FilterRejected,
    Timeout,
    Internal,
    /// the guest attempted traffic outside the tunnel allowlist
    TunnelSecurityViolation,
}

//
// error types observable by callers of the network core
//

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum NetError {
    #[error("net: invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("net: not connected")]
    NotConnected,
    #[error("net: already connected")]
    AlreadyConnected,
    #[error("net: traffic routing not enabled")]
    TrafficRoutingNotEnabled,
    #[error("net: netstack error: {0}")]
    Netstack(String),
    #[error("net: timed out")]
    Timeout,
    #[error("net: both peers behind symmetric NAT")]
    BothSymmetric,
    #[error("net: firewall blocked traversal")]
    FirewallBlocked,
    #[error("net: peer unreachable")]
    PeerUnreachable,
    #[error("net: failed to bind local socket: {0}")]
    BindFailed(String),
    #[error("net: invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("net: already joined this network")]
    AlreadyJoined,
    #[error("net: not found")]
    NotFound,
    #[error("net: filtering mode requires a consumer endpoint")]
    FilteringRequiresEndpoint,
    #[error("net: announcement signature invalid")]
    SignatureInvalid,
    #[error("net: transport error: {0}")]
    Transport(String),
}

#[allow(dead_code)]
impl NetError {
    pub fn kind(&self) -> &str {
        match *self {
            NetError::InvalidConfiguration(_) => "InvalidConfiguration",
            NetError::NotConnected => "NotConnected",
            NetError::AlreadyConnected => "AlreadyConnected",
            NetError::TrafficRoutingNotEnabled => "TrafficRoutingNotEnabled",
            NetError::Netstack(_) => "Netstack",
            NetError::Timeout => "Timeout",
            NetError::BothSymmetric => "BothSymmetric",
            NetError::FirewallBlocked => "FirewallBlocked",
            NetError::PeerUnreachable => "PeerUnreachable",
            NetError::BindFailed(_) => "BindFailed",
            NetError::InvalidEndpoint(_) => "InvalidEndpoint",
            NetError::AlreadyJoined => "AlreadyJoined",
            NetError::NotFound => "NotFound",
            NetError::FilteringRequiresEndpoint => "FilteringRequiresEndpoint",
            NetError::SignatureInvalid => "SignatureInvalid",
            NetError::Transport(_) => "Transport",
        }
    }
}
