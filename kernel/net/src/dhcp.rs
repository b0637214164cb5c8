//! DHCP client.
//!
//! Classic four-step lease: broadcast DISCOVER, take the first OFFER,
//! REQUEST it, and on ACK adopt address, netmask, gateway and DNS
//! server. While unbound, DISCOVER is re-broadcast every two seconds.

use alloc::vec::Vec;

use crate::stack::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT, NetStack};
use crate::wire::Ipv4Addr;
use crate::NetDevice;

/// "This is a DHCP message" magic cookie.
const MAGIC_COOKIE: u32 = 0x6382_5363;

/// Fixed part of the BOOTP message, up to and including the cookie.
const FIXED_LEN: usize = 240;

// Option tags.
const OPT_SUBNET: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_MSG_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAM_LIST: u8 = 55;
const OPT_END: u8 = 255;

// Message types.
const DHCP_DISCOVER: u8 = 1;
const DHCP_OFFER: u8 = 2;
const DHCP_REQUEST: u8 = 3;
const DHCP_ACK: u8 = 5;

/// Lease acquisition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DhcpState {
    Init,
    DiscoverSent,
    RequestSent,
    Bound,
}

/// Client-side lease state machine.
#[derive(Debug)]
pub(crate) struct DhcpClient {
    pub state: DhcpState,
    pub xid: u32,
    pub offer_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub last_send_tick: u64,
}

impl DhcpClient {
    pub fn new(xid: u32) -> Self {
        Self {
            state: DhcpState::Init,
            xid,
            offer_ip: Ipv4Addr::UNSET,
            server_ip: Ipv4Addr::UNSET,
            last_send_tick: 0,
        }
    }
}

/// Values parsed out of a server reply.
#[derive(Debug, Default, Clone, Copy)]
struct ParsedReply {
    msg_type: u8,
    yiaddr: Ipv4Addr,
    server_id: Ipv4Addr,
    subnet: Ipv4Addr,
    router: Ipv4Addr,
    dns: Ipv4Addr,
}

fn parse_reply(payload: &[u8], xid: u32) -> Option<ParsedReply> {
    if payload.len() < FIXED_LEN {
        return None;
    }
    // op must be BOOTREPLY and the transaction must be ours.
    if payload[0] != 2 || crate::wire::get_u32(payload, 4) != xid {
        return None;
    }
    if crate::wire::get_u32(payload, 236) != MAGIC_COOKIE {
        return None;
    }

    let mut reply = ParsedReply {
        yiaddr: Ipv4Addr([payload[16], payload[17], payload[18], payload[19]]),
        ..ParsedReply::default()
    };

    let mut at = FIXED_LEN;
    while at < payload.len() && payload[at] != OPT_END {
        let tag = payload[at];
        if tag == 0 {
            at += 1;
            continue;
        }
        if at + 1 >= payload.len() {
            break;
        }
        let len = usize::from(payload[at + 1]);
        at += 2;
        if at + len > payload.len() {
            break;
        }
        let value = &payload[at..at + len];
        match (tag, len) {
            (OPT_MSG_TYPE, 1) => reply.msg_type = value[0],
            (OPT_SERVER_ID, 4) => reply.server_id = Ipv4Addr([value[0], value[1], value[2], value[3]]),
            (OPT_SUBNET, 4) => reply.subnet = Ipv4Addr([value[0], value[1], value[2], value[3]]),
            (OPT_ROUTER, 4..) => reply.router = Ipv4Addr([value[0], value[1], value[2], value[3]]),
            (OPT_DNS, 4..) => reply.dns = Ipv4Addr([value[0], value[1], value[2], value[3]]),
            _ => {}
        }
        at += len;
    }
    Some(reply)
}

impl<D: NetDevice> NetStack<D> {
    /// Builds the fixed BOOTP part shared by DISCOVER and REQUEST.
    fn dhcp_message_head(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(FIXED_LEN + 32);
        msg.resize(FIXED_LEN, 0);
        msg[0] = 1; // BOOTREQUEST
        msg[1] = 1; // Ethernet
        msg[2] = 6; // hardware address length
        crate::wire::put_u32(&mut msg, 4, self.dhcp.xid);
        crate::wire::put_u16(&mut msg, 10, 0x8000); // broadcast flag
        msg[28..34].copy_from_slice(&self.mac.0);
        crate::wire::put_u32(&mut msg, 236, MAGIC_COOKIE);
        msg
    }

    /// Broadcasts a DISCOVER and arms the retry timer.
    pub(crate) fn dhcp_send_discover(&mut self, now: u64) {
        let mut msg = self.dhcp_message_head();
        msg.extend_from_slice(&[OPT_MSG_TYPE, 1, DHCP_DISCOVER]);
        msg.extend_from_slice(&[OPT_PARAM_LIST, 3, OPT_SUBNET, OPT_ROUTER, OPT_DNS]);
        msg.push(OPT_END);
        self.send_udp(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT, DHCP_SERVER_PORT, &msg);
        self.dhcp.last_send_tick = now;
        self.dhcp.state = DhcpState::DiscoverSent;
    }

    fn dhcp_send_request(&mut self, now: u64) {
        let offer = self.dhcp.offer_ip;
        let server = self.dhcp.server_ip;
        let mut msg = self.dhcp_message_head();
        msg.extend_from_slice(&[OPT_MSG_TYPE, 1, DHCP_REQUEST]);
        msg.extend_from_slice(&[OPT_REQUESTED_IP, 4]);
        msg.extend_from_slice(&offer.0);
        msg.extend_from_slice(&[OPT_SERVER_ID, 4]);
        msg.extend_from_slice(&server.0);
        msg.extend_from_slice(&[OPT_PARAM_LIST, 3, OPT_SUBNET, OPT_ROUTER, OPT_DNS]);
        msg.push(OPT_END);
        self.send_udp(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT, DHCP_SERVER_PORT, &msg);
        self.dhcp.last_send_tick = now;
        self.dhcp.state = DhcpState::RequestSent;
    }

    /// Handles a datagram that arrived on the DHCP client port.
    pub(crate) fn handle_dhcp(&mut self, payload: &[u8], now: u64) {
        let Some(reply) = parse_reply(payload, self.dhcp.xid) else {
            return;
        };

        match (reply.msg_type, self.dhcp.state) {
            (DHCP_OFFER, DhcpState::DiscoverSent) => {
                self.dhcp.offer_ip = reply.yiaddr;
                self.dhcp.server_ip = reply.server_id;
                self.dhcp_send_request(now);
            }
            (DHCP_ACK, DhcpState::RequestSent) => {
                self.config.ip = reply.yiaddr;
                self.config.netmask = reply.subnet;
                self.config.gateway = reply.router;
                self.config.dns = reply.dns;
                self.dhcp.state = DhcpState::Bound;
                self.ready = true;
            }
            _ => {}
        }
    }

    /// Re-broadcasts DISCOVER while unbound and quiet for two seconds.
    pub(crate) fn dhcp_poll(&mut self, now: u64) {
        if self.dhcp.state != DhcpState::Bound
            && now.wrapping_sub(self.dhcp.last_send_tick) > 2 * self.ticks_per_sec
        {
            self.dhcp_send_discover(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::testutil::{FakeNic, PEER_MAC, STACK_MAC};
    use crate::wire::{ETHERTYPE_IPV4, EthHeader, Ipv4Header, MacAddr, UdpHeader};

    const TPS: u64 = 100;

    fn server_reply(xid: u32, msg_type: u8, extra_opts: &[u8]) -> Vec<u8> {
        let mut msg = vec![0u8; FIXED_LEN];
        msg[0] = 2; // BOOTREPLY
        crate::wire::put_u32(&mut msg, 4, xid);
        msg[16..20].copy_from_slice(&[192, 168, 7, 50]); // yiaddr
        crate::wire::put_u32(&mut msg, 236, MAGIC_COOKIE);
        msg.extend_from_slice(&[OPT_MSG_TYPE, 1, msg_type]);
        msg.extend_from_slice(&[OPT_SERVER_ID, 4, 192, 168, 7, 1]);
        msg.extend_from_slice(extra_opts);
        msg.push(OPT_END);

        let udp = UdpHeader::build(DHCP_SERVER_PORT, DHCP_CLIENT_PORT, &msg);
        let ip = Ipv4Header::build(
            Ipv4Addr::new(192, 168, 7, 1),
            Ipv4Addr::BROADCAST,
            crate::wire::IPPROTO_UDP,
            1,
            &udp,
        );
        EthHeader::build(MacAddr::BROADCAST, PEER_MAC, ETHERTYPE_IPV4, &ip)
    }

    fn last_dhcp_msg_type(stack_frames: &mut std::collections::VecDeque<Vec<u8>>) -> u8 {
        let frame = stack_frames.pop_back().unwrap();
        let (_, ip) = EthHeader::parse(&frame).unwrap();
        let (_, udp) = Ipv4Header::parse(ip).unwrap();
        let (_, dhcp) = UdpHeader::parse(udp).unwrap();
        // First option right after the cookie is the message type.
        assert_eq!(dhcp[FIXED_LEN], OPT_MSG_TYPE);
        dhcp[FIXED_LEN + 2]
    }

    #[test]
    fn full_lease_handshake() {
        let mut stack = NetStack::new(FakeNic::new(), TPS, 1);
        assert_eq!(last_dhcp_msg_type(&mut stack.dev.sent), DHCP_DISCOVER);
        let xid = stack.dhcp.xid;

        stack.dev.incoming.push_back(server_reply(xid, DHCP_OFFER, &[]));
        stack.poll(2);
        assert_eq!(last_dhcp_msg_type(&mut stack.dev.sent), DHCP_REQUEST);

        let net_opts = [
            OPT_SUBNET, 4, 255, 255, 255, 0,
            OPT_ROUTER, 4, 192, 168, 7, 1,
            OPT_DNS, 4, 192, 168, 7, 1,
        ];
        stack.dev.incoming.push_back(server_reply(xid, DHCP_ACK, &net_opts));
        stack.poll(3);

        assert!(stack.is_up());
        let config = stack.config();
        assert_eq!(config.ip, Ipv4Addr::new(192, 168, 7, 50));
        assert_eq!(config.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.gateway, Ipv4Addr::new(192, 168, 7, 1));
        assert_eq!(config.dns, Ipv4Addr::new(192, 168, 7, 1));
    }

    #[test]
    fn wrong_xid_is_ignored() {
        let mut stack = NetStack::new(FakeNic::new(), TPS, 1);
        stack.dev.sent.clear();
        let wrong = stack.dhcp.xid ^ 1;
        stack.dev.incoming.push_back(server_reply(wrong, DHCP_OFFER, &[]));
        stack.poll(2);
        assert!(stack.dev.sent.is_empty());
        assert!(!stack.is_up());
    }

    #[test]
    fn discover_retries_after_two_seconds() {
        let mut stack = NetStack::new(FakeNic::new(), TPS, 1);
        stack.dev.sent.clear();

        stack.poll(2 * TPS); // not yet: elapsed == 2 s is not > 2 s
        assert!(stack.dev.sent.is_empty());

        stack.poll(2 * TPS + 2);
        assert_eq!(last_dhcp_msg_type(&mut stack.dev.sent), DHCP_DISCOVER);
    }

    #[test]
    fn stack_mac_lands_in_chaddr() {
        let mut stack = NetStack::new(FakeNic::new(), TPS, 1);
        let frame = stack.dev.sent.pop_back().unwrap();
        let (_, ip) = EthHeader::parse(&frame).unwrap();
        let (_, udp) = Ipv4Header::parse(ip).unwrap();
        let (_, dhcp) = UdpHeader::parse(udp).unwrap();
        assert_eq!(&dhcp[28..34], &STACK_MAC.0);
    }
}
