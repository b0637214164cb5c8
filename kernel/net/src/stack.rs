//! The network stack facade: device plumbing, frame demux, IPv4/UDP
//! transmit paths, and the periodic timer work.

use crate::arp::ArpCache;
use crate::dhcp::DhcpClient;
use crate::dns::DnsClient;
use crate::tcp::TcpConn;
use crate::wire::{
    ETHERTYPE_ARP, ETHERTYPE_IPV4, EthHeader, IPPROTO_TCP, IPPROTO_UDP, Ipv4Addr, Ipv4Header,
    MacAddr, UdpHeader,
};
use crate::{MAX_FRAME, NetDevice};

/// UDP port the DHCP client listens on.
pub(crate) const DHCP_CLIENT_PORT: u16 = 68;
/// UDP port of DHCP servers.
pub(crate) const DHCP_SERVER_PORT: u16 = 67;
/// Fixed local port for DNS queries.
pub(crate) const DNS_CLIENT_PORT: u16 = 49152;
/// DNS server port.
pub(crate) const DNS_SERVER_PORT: u16 = 53;

/// Interface addressing, learned from DHCP (all unset until bound).
#[derive(Debug, Clone, Copy, Default)]
pub struct IfaceConfig {
    /// Local address.
    pub ip: Ipv4Addr,
    /// Subnet mask.
    pub netmask: Ipv4Addr,
    /// Default gateway.
    pub gateway: Ipv4Addr,
    /// Resolver address.
    pub dns: Ipv4Addr,
}

/// One Ethernet interface with ARP, DHCP, DNS and a single TCP
/// connection on top.
pub struct NetStack<D: NetDevice> {
    pub(crate) dev: D,
    pub(crate) mac: MacAddr,
    pub(crate) config: IfaceConfig,
    pub(crate) ready: bool,
    pub(crate) arp: ArpCache,
    pub(crate) dhcp: DhcpClient,
    pub(crate) dns: DnsClient,
    pub(crate) tcp: TcpConn,
    pub(crate) ticks_per_sec: u64,
    ip_id: u16,
}

impl<D: NetDevice> NetStack<D> {
    /// Wraps `dev` and kicks off DHCP discovery.
    ///
    /// `ticks_per_sec` scales every protocol timeout; `now` seeds the
    /// DHCP transaction id.
    pub fn new(dev: D, ticks_per_sec: u64, now: u64) -> Self {
        let mac = dev.mac();
        let mut stack = Self {
            dev,
            mac,
            config: IfaceConfig::default(),
            ready: false,
            arp: ArpCache::default(),
            dhcp: DhcpClient::new((now ^ 0xA5A5_A5A5) as u32),
            dns: DnsClient::default(),
            tcp: TcpConn::new(),
            ticks_per_sec,
            ip_id: 1,
        };
        stack.dhcp_send_discover(now);
        stack
    }

    /// The wrapped device.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    /// Whether DHCP has bound an address.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.ready && !self.config.ip.is_unset()
    }

    /// Current interface addressing.
    #[must_use]
    pub fn config(&self) -> IfaceConfig {
        self.config
    }

    /// Drains received frames and runs the protocol timers. Call this
    /// from the net task on every loop iteration.
    pub fn poll(&mut self, now: u64) {
        let mut frame = [0u8; MAX_FRAME];
        while let Some(len) = self.dev.recv(&mut frame) {
            let Some((eth, payload)) = EthHeader::parse(&frame[..len]) else {
                continue;
            };
            match eth.ethertype {
                ETHERTYPE_ARP => self.handle_arp(payload, now),
                ETHERTYPE_IPV4 => self.handle_ipv4(payload, now),
                _ => {}
            }
        }

        self.tcp_poll_retransmit(now);
        self.dhcp_poll(now);
    }

    /// Sends one Ethernet frame, stamping the local source MAC.
    pub(crate) fn send_frame(&mut self, dst: MacAddr, ethertype: u16, payload: &[u8]) -> bool {
        if payload.len() + crate::wire::ETH_HLEN > MAX_FRAME {
            return false;
        }
        let frame = EthHeader::build(dst, self.mac, ethertype, payload);
        self.dev.send(&frame)
    }

    /// Sends an IPv4 packet, resolving the layer-2 destination.
    ///
    /// Broadcast (or an unconfigured interface) goes to ff:ff:..:ff;
    /// off-subnet destinations route via the gateway. On an ARP miss a
    /// request is sent and the packet is dropped; the caller's
    /// retransmission logic covers the gap.
    pub(crate) fn send_ipv4(&mut self, dst_ip: Ipv4Addr, proto: u8, payload: &[u8]) -> bool {
        let broadcast = dst_ip == Ipv4Addr::BROADCAST || self.config.ip.is_unset();
        let dst_mac = if broadcast {
            MacAddr::BROADCAST
        } else {
            let mut target = dst_ip;
            if !self.config.netmask.is_unset()
                && !self.config.gateway.is_unset()
                && !self.config.ip.same_subnet(dst_ip, self.config.netmask)
            {
                target = self.config.gateway;
            }
            match self.arp.lookup(target) {
                Some(mac) => mac,
                None => {
                    self.arp_send_request(target);
                    return false;
                }
            }
        };

        let id = self.ip_id;
        self.ip_id = self.ip_id.wrapping_add(1);
        let packet = Ipv4Header::build(self.config.ip, dst_ip, proto, id, payload);
        self.send_frame(dst_mac, ETHERTYPE_IPV4, &packet)
    }

    /// Sends a UDP datagram.
    pub(crate) fn send_udp(
        &mut self,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> bool {
        let datagram = UdpHeader::build(src_port, dst_port, payload);
        self.send_ipv4(dst_ip, IPPROTO_UDP, &datagram)
    }

    fn handle_ipv4(&mut self, packet: &[u8], now: u64) {
        let Some((header, payload)) = Ipv4Header::parse(packet) else {
            return;
        };
        match header.proto {
            IPPROTO_UDP => {
                let Some((udp, data)) = UdpHeader::parse(payload) else {
                    return;
                };
                match udp.dst_port {
                    DHCP_CLIENT_PORT => self.handle_dhcp(data, now),
                    DNS_CLIENT_PORT => self.handle_dns(data),
                    _ => {}
                }
            }
            IPPROTO_TCP => self.handle_tcp(payload, header.src, now),
            _ => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A scripted NIC for driving the stack without hardware.

    use super::*;
    use std::collections::VecDeque;

    pub const STACK_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
    pub const PEER_MAC: MacAddr = MacAddr([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);

    pub struct FakeNic {
        pub sent: VecDeque<Vec<u8>>,
        pub incoming: VecDeque<Vec<u8>>,
    }

    impl FakeNic {
        pub fn new() -> Self {
            Self {
                sent: VecDeque::new(),
                incoming: VecDeque::new(),
            }
        }
    }

    impl NetDevice for FakeNic {
        fn mac(&self) -> MacAddr {
            STACK_MAC
        }

        fn send(&mut self, frame: &[u8]) -> bool {
            self.sent.push_back(frame.to_vec());
            true
        }

        fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
            let frame = self.incoming.pop_front()?;
            buf[..frame.len()].copy_from_slice(&frame);
            Some(frame.len())
        }
    }

    /// A stack with a bound static configuration (skipping DHCP) and a
    /// warm ARP entry for the peer.
    pub fn configured_stack(peer_ip: Ipv4Addr) -> NetStack<FakeNic> {
        let mut stack = NetStack::new(FakeNic::new(), 100, 0);
        stack.dev.sent.clear(); // drop the DHCP discover
        stack.config = IfaceConfig {
            ip: Ipv4Addr::new(192, 168, 7, 2),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 7, 1),
            dns: Ipv4Addr::new(192, 168, 7, 1),
        };
        stack.ready = true;
        stack.dhcp.state = crate::dhcp::DhcpState::Bound;
        stack.arp.update(peer_ip, PEER_MAC, 0);
        // Off-subnet traffic resolves through the gateway.
        stack.arp.update(stack.config.gateway, PEER_MAC, 0);
        stack
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::wire::{ARP_OP_REPLY, ARP_OP_REQUEST, ArpPacket, checksum};

    #[test]
    fn unknown_neighbor_triggers_arp_request_and_drop() {
        let peer = Ipv4Addr::new(192, 168, 7, 3);
        let mut stack = configured_stack(peer);
        let stranger = Ipv4Addr::new(192, 168, 7, 77);

        assert!(!stack.send_udp(stranger, 1000, 2000, b"x"));
        let frame = stack.dev.sent.pop_back().unwrap();
        let (eth, payload) = EthHeader::parse(&frame).unwrap();
        assert_eq!(eth.ethertype, ETHERTYPE_ARP);
        assert_eq!(eth.dst, MacAddr::BROADCAST);
        let arp = ArpPacket::parse(payload).unwrap();
        assert_eq!(arp.oper, ARP_OP_REQUEST);
        assert_eq!(arp.tpa, stranger);
    }

    #[test]
    fn off_subnet_goes_to_gateway() {
        let peer = Ipv4Addr::new(192, 168, 7, 3);
        let mut stack = configured_stack(peer);
        let remote = Ipv4Addr::new(93, 184, 216, 34);

        assert!(stack.send_udp(remote, 1000, 53, b"q"));
        let frame = stack.dev.sent.pop_back().unwrap();
        let (eth, payload) = EthHeader::parse(&frame).unwrap();
        // Resolved via the gateway's (= peer's) cached MAC.
        assert_eq!(eth.dst, PEER_MAC);
        let (ip, _) = Ipv4Header::parse(payload).unwrap();
        assert_eq!(ip.dst, remote);
        // Header checksum must verify.
        assert_eq!(checksum(&payload[..20]), 0);
    }

    #[test]
    fn arp_request_for_our_ip_is_answered() {
        let peer = Ipv4Addr::new(192, 168, 7, 3);
        let mut stack = configured_stack(peer);
        let request = ArpPacket {
            oper: ARP_OP_REQUEST,
            sha: PEER_MAC,
            spa: peer,
            tha: MacAddr::ZERO,
            tpa: stack.config.ip,
        };
        let frame = EthHeader::build(MacAddr::BROADCAST, PEER_MAC, ETHERTYPE_ARP, &request.build());
        stack.dev.incoming.push_back(frame);
        stack.poll(1);

        let reply = stack.dev.sent.pop_back().unwrap();
        let (eth, payload) = EthHeader::parse(&reply).unwrap();
        assert_eq!(eth.dst, PEER_MAC);
        let arp = ArpPacket::parse(payload).unwrap();
        assert_eq!(arp.oper, ARP_OP_REPLY);
        assert_eq!(arp.spa, stack.config.ip);
        assert_eq!(arp.tpa, peer);
    }

    #[test]
    fn arp_reply_warms_cache_for_later_sends() {
        let peer = Ipv4Addr::new(192, 168, 7, 3);
        let mut stack = configured_stack(peer);
        let stranger_ip = Ipv4Addr::new(192, 168, 7, 42);
        let stranger_mac = MacAddr([7; 6]);

        let reply = ArpPacket {
            oper: ARP_OP_REPLY,
            sha: stranger_mac,
            spa: stranger_ip,
            tha: STACK_MAC,
            tpa: stack.config.ip,
        };
        let frame = EthHeader::build(STACK_MAC, stranger_mac, ETHERTYPE_ARP, &reply.build());
        stack.dev.incoming.push_back(frame);
        stack.poll(1);

        assert!(stack.send_udp(stranger_ip, 1, 2, b"now it works"));
        let sent = stack.dev.sent.pop_back().unwrap();
        let (eth, _) = EthHeader::parse(&sent).unwrap();
        assert_eq!(eth.dst, stranger_mac);
    }
}
