pub mod endpoint;
pub mod ethernet;
pub mod ipv4;

pub use endpoint::Endpoint;
pub use ethernet::{EthernetFrame, MacAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
pub use ipv4::{Ipv4Packet, Ipv4Protocol};
