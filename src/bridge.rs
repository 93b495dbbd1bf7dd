use crate::packet::{
    ipv4::build_udp_packet, Endpoint, EthernetFrame, Ipv4Packet, MacAddr, ETHERTYPE_IPV4,
};
use std::net::Ipv4Addr;

/// The MAC the guest sees as its gateway: locally-administered unicast.
pub const DEFAULT_GATEWAY_MAC: MacAddr = MacAddr([0x06, 0xa0, 0xde, 0x00, 0x00, 0x01]);

/// Bidirectional translation between the guest's Ethernet NIC and the stream
/// of IPv4 packets routed through the tunnel session.
///
/// The first IPv4 frame the guest emits teaches us its MAC and IP; if the
/// guest reconfigures, later frames update both. Until both are learned,
/// response synthesis refuses rather than fabricating an unroutable frame.
pub struct FramePacketBridge {
    vm_mac: Option<MacAddr>,
    vm_ip: Option<Ipv4Addr>,
    gateway_mac: MacAddr,
    frames_seen: u64,
    non_ipv4_ignored: u64,
    malformed_dropped: u64,
}

impl Default for FramePacketBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePacketBridge {
    pub fn new() -> Self {
        Self::with_gateway_mac(DEFAULT_GATEWAY_MAC)
    }

    pub fn with_gateway_mac(gateway_mac: MacAddr) -> Self {
        FramePacketBridge {
            vm_mac: None,
            vm_ip: None,
            gateway_mac,
            frames_seen: 0,
            non_ipv4_ignored: 0,
            malformed_dropped: 0,
        }
    }

    pub fn vm_mac(&self) -> Option<MacAddr> {
        self.vm_mac
    }

    pub fn vm_ip(&self) -> Option<Ipv4Addr> {
        self.vm_ip
    }

    pub fn gateway_mac(&self) -> MacAddr {
        self.gateway_mac
    }

    /// Egress: raw frame from the guest NIC in, IPv4 packet out.
    /// ARP, IPv6 and malformed frames yield None and are only counted.
    pub fn extract_egress(&mut self, frame: &[u8]) -> Option<Ipv4Packet> {
        self.frames_seen += 1;
        let Some(frame) = EthernetFrame::parse(frame) else {
            self.malformed_dropped += 1;
            return None;
        };
        if !frame.is_ipv4() {
            self.non_ipv4_ignored += 1;
            return None;
        }
        let Some(packet) = Ipv4Packet::parse(&frame.payload) else {
            self.malformed_dropped += 1;
            return None;
        };
        self.vm_mac = Some(frame.source_mac);
        self.vm_ip = Some(packet.source_address);
        Some(packet)
    }

    /// Ingress: wrap a UDP payload coming back off the tunnel into a
    /// synthetic Ethernet frame for the guest. None until the guest's MAC
    /// and IP have been learned from egress traffic.
    pub fn wrap_response(
        &self,
        udp_payload: &[u8],
        source: Endpoint,
        vm_port: u16,
    ) -> Option<EthernetFrame> {
        let vm_mac = self.vm_mac?;
        let vm_ip = self.vm_ip?;
        let packet = build_udp_packet(source, Endpoint::new(vm_ip, vm_port), udp_payload);
        Some(EthernetFrame {
            destination_mac: vm_mac,
            source_mac: self.gateway_mac,
            ethertype: ETHERTYPE_IPV4,
            payload: packet,
        })
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (self.frames_seen, self.non_ipv4_ignored, self.malformed_dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ETHERTYPE_ARP, ETHERTYPE_IPV6};

    const VM_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

    fn guest_frame(dst: &str, payload: &[u8]) -> Vec<u8> {
        let packet = build_udp_packet(
            "192.168.64.2:12345".parse().unwrap(),
            dst.parse().unwrap(),
            payload,
        );
        EthernetFrame {
            destination_mac: DEFAULT_GATEWAY_MAC,
            source_mac: VM_MAC,
            ethertype: ETHERTYPE_IPV4,
            payload: packet,
        }
        .to_bytes()
    }

    #[test]
    fn egress_extracts_and_learns() {
        let mut bridge = FramePacketBridge::new();
        let packet = bridge
            .extract_egress(&guest_frame("203.0.113.50:51900", &[0xde, 0xad, 0xbe, 0xef]))
            .unwrap();
        assert_eq!(packet.source_endpoint().unwrap().to_string(), "192.168.64.2:12345");
        assert_eq!(
            packet.destination_endpoint().unwrap().to_string(),
            "203.0.113.50:51900"
        );
        assert_eq!(packet.udp_payload(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
        assert_eq!(bridge.vm_mac(), Some(VM_MAC));
        assert_eq!(bridge.vm_ip(), Some(Ipv4Addr::new(192, 168, 64, 2)));
    }

    #[test]
    fn response_roundtrip() {
        let mut bridge = FramePacketBridge::new();
        bridge.extract_egress(&guest_frame("203.0.113.50:51900", b"req"));

        let frame = bridge
            .wrap_response(&[0xca, 0xfe, 0xba, 0xbe], "203.0.113.50:51900".parse().unwrap(), 12345)
            .unwrap();
        assert_eq!(frame.destination_mac, VM_MAC);
        assert_eq!(frame.source_mac, DEFAULT_GATEWAY_MAC);
        assert_eq!(frame.ethertype, ETHERTYPE_IPV4);

        let packet = Ipv4Packet::parse(&frame.payload).unwrap();
        assert_eq!(packet.source_endpoint().unwrap().to_string(), "203.0.113.50:51900");
        assert_eq!(packet.destination_endpoint().unwrap().to_string(), "192.168.64.2:12345");
        assert_eq!(packet.udp_payload(), Some(&[0xca, 0xfe, 0xba, 0xbe][..]));
    }

    #[test]
    fn refuses_before_learning() {
        let bridge = FramePacketBridge::new();
        assert!(bridge
            .wrap_response(b"x", "203.0.113.50:51900".parse().unwrap(), 1)
            .is_none());
    }

    #[test]
    fn ignores_arp_and_ipv6() {
        let mut bridge = FramePacketBridge::new();
        for ethertype in [ETHERTYPE_ARP, ETHERTYPE_IPV6] {
            let frame = EthernetFrame {
                destination_mac: MacAddr([0xff; 6]),
                source_mac: VM_MAC,
                ethertype,
                payload: vec![0; 28],
            };
            assert!(bridge.extract_egress(&frame.to_bytes()).is_none());
        }
        // non-IPv4 traffic must not teach us a MAC
        assert_eq!(bridge.vm_mac(), None);
        assert_eq!(bridge.counters().1, 2);
    }

    #[test]
    fn relearns_on_reconfiguration() {
        let mut bridge = FramePacketBridge::new();
        bridge.extract_egress(&guest_frame("203.0.113.50:51900", b"a"));

        let new_mac = MacAddr([0x02, 0, 0, 0, 0, 0x02]);
        let packet = build_udp_packet(
            "192.168.64.9:2000".parse().unwrap(),
            "203.0.113.50:51900".parse().unwrap(),
            b"b",
        );
        let frame = EthernetFrame {
            destination_mac: DEFAULT_GATEWAY_MAC,
            source_mac: new_mac,
            ethertype: ETHERTYPE_IPV4,
            payload: packet,
        };
        bridge.extract_egress(&frame.to_bytes());
        assert_eq!(bridge.vm_mac(), Some(new_mac));
        assert_eq!(bridge.vm_ip(), Some(Ipv4Addr::new(192, 168, 64, 9)));
    }
}
