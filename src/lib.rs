pub mod bridge;
pub mod dht;
pub mod filter;
pub mod identity;
pub mod mesh;
pub mod nat;
pub mod netstack;
pub mod network_key;
pub mod p2p;
pub mod packet;
pub mod relay;
pub mod rendezvous;
pub mod session;
pub mod types;
pub mod vm;

pub use identity::IdentityKeypair;
pub use packet::{Endpoint, EthernetFrame, Ipv4Packet};
pub use session::TunnelSession;
pub use types::*;
