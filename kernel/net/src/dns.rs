//! DNS resolver: one in-flight A query at a time.

use alloc::vec::Vec;

use crate::stack::{DNS_CLIENT_PORT, DNS_SERVER_PORT, NetStack};
use crate::wire::{Ipv4Addr, get_u16};
use crate::NetDevice;

/// DNS header length.
const DNS_HLEN: usize = 12;

/// Fallback resolver when DHCP supplied none.
const FALLBACK_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// In-flight query state.
#[derive(Debug, Default)]
pub(crate) struct DnsClient {
    pub pending: bool,
    pub txid: u16,
    pub result: Option<Ipv4Addr>,
}

/// Skips one (possibly compressed) DNS name, returning the offset just
/// past it, or `None` on truncation.
fn skip_name(payload: &[u8], mut at: usize) -> Option<usize> {
    while at < payload.len() {
        let len = payload[at];
        if len == 0 {
            return Some(at + 1);
        }
        // Compression pointer: two bytes, ends the name.
        if len & 0xC0 == 0xC0 {
            if at + 1 >= payload.len() {
                return None;
            }
            return Some(at + 2);
        }
        at += 1 + usize::from(len);
        if at > payload.len() {
            return None;
        }
    }
    None
}

/// Builds a recursion-desired query with a single A/IN question.
fn build_query(host: &str, txid: u16) -> Vec<u8> {
    let mut query = Vec::with_capacity(DNS_HLEN + host.len() + 6);
    query.extend_from_slice(&txid.to_be_bytes());
    query.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    query.extend_from_slice(&1u16.to_be_bytes()); // one question
    query.extend_from_slice(&[0; 6]); // an/ns/ar counts
    for label in host.split('.') {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&1u16.to_be_bytes()); // type A
    query.extend_from_slice(&1u16.to_be_bytes()); // class IN
    query
}

impl<D: NetDevice> NetStack<D> {
    /// Sends an A query for `host` to the configured (or fallback)
    /// resolver. The answer arrives through [`poll`](Self::poll); fetch
    /// it with [`dns_take_result`](Self::dns_take_result).
    ///
    /// Returns `false` when the interface is down.
    pub fn dns_query(&mut self, host: &str, now: u64) -> bool {
        if !self.is_up() {
            return false;
        }
        if self.config.dns.is_unset() {
            self.config.dns = FALLBACK_DNS;
        }
        self.dns.pending = true;
        self.dns.result = None;
        self.dns.txid = (now ^ 0x1234) as u16;

        let query = build_query(host, self.dns.txid);
        let dns_server = self.config.dns;
        self.send_udp(dns_server, DNS_CLIENT_PORT, DNS_SERVER_PORT, &query)
    }

    /// Whether a query is still waiting for its answer.
    #[must_use]
    pub fn dns_pending(&self) -> bool {
        self.dns.pending
    }

    /// Takes the resolved address, if the last query succeeded.
    pub fn dns_take_result(&mut self) -> Option<Ipv4Addr> {
        self.dns.result.take()
    }

    /// Abandons the in-flight query (resolve timeout).
    pub fn dns_cancel(&mut self) {
        self.dns.pending = false;
    }

    /// Handles a datagram that arrived on the DNS client port: the
    /// first A answer of the matching transaction wins.
    pub(crate) fn handle_dns(&mut self, payload: &[u8]) {
        if !self.dns.pending || payload.len() < DNS_HLEN {
            return;
        }
        if get_u16(payload, 0) != self.dns.txid {
            return;
        }
        // Only responses count.
        if get_u16(payload, 2) & 0x8000 == 0 {
            return;
        }
        let qdcount = get_u16(payload, 4);
        let ancount = get_u16(payload, 6);

        let mut at = DNS_HLEN;
        for _ in 0..qdcount {
            let Some(next) = skip_name(payload, at) else {
                return;
            };
            at = next + 4; // qtype + qclass
            if at > payload.len() {
                return;
            }
        }

        for _ in 0..ancount {
            let Some(next) = skip_name(payload, at) else {
                return;
            };
            at = next;
            if at + 10 > payload.len() {
                return;
            }
            let rtype = get_u16(payload, at);
            let rclass = get_u16(payload, at + 2);
            let rdlen = usize::from(get_u16(payload, at + 8));
            at += 10;
            if at + rdlen > payload.len() {
                return;
            }
            if rtype == 1 && rclass == 1 && rdlen == 4 {
                self.dns.result = Some(Ipv4Addr([
                    payload[at],
                    payload[at + 1],
                    payload[at + 2],
                    payload[at + 3],
                ]));
                self.dns.pending = false;
                return;
            }
            at += rdlen;
        }

        if ancount == 0 {
            // NXDOMAIN or empty answer: stop waiting.
            self.dns.pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::testutil::{configured_stack, PEER_MAC};
    use crate::wire::{ETHERTYPE_IPV4, EthHeader, IPPROTO_UDP, Ipv4Header, UdpHeader};

    fn query_question(stack_frame: &[u8]) -> Vec<u8> {
        let (_, ip) = EthHeader::parse(stack_frame).unwrap();
        let (_, udp) = Ipv4Header::parse(ip).unwrap();
        let (header, dns) = UdpHeader::parse(udp).unwrap();
        assert_eq!(header.dst_port, DNS_SERVER_PORT);
        dns.to_vec()
    }

    fn answer_frame(stack: &NetStack<crate::stack::testutil::FakeNic>, txid: u16, addr: [u8; 4], compressed: bool) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&txid.to_be_bytes());
        msg.extend_from_slice(&0x8180u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes()); // qd
        msg.extend_from_slice(&1u16.to_be_bytes()); // an
        msg.extend_from_slice(&[0; 4]);
        // Question: example.com A IN
        for label in ["example", "com"] {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&[0, 1, 0, 1]);
        // Answer name: compression pointer to offset 12, or repeated.
        if compressed {
            msg.extend_from_slice(&[0xC0, 0x0C]);
        } else {
            for label in ["example", "com"] {
                msg.push(label.len() as u8);
                msg.extend_from_slice(label.as_bytes());
            }
            msg.push(0);
        }
        msg.extend_from_slice(&[0, 1, 0, 1]); // A, IN
        msg.extend_from_slice(&[0, 0, 0, 60]); // TTL
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&addr);

        let udp = UdpHeader::build(DNS_SERVER_PORT, DNS_CLIENT_PORT, &msg);
        let ip = Ipv4Header::build(stack.config.dns, stack.config.ip, IPPROTO_UDP, 9, &udp);
        EthHeader::build(stack.mac, PEER_MAC, ETHERTYPE_IPV4, &ip)
    }

    #[test]
    fn query_encodes_labels() {
        let mut stack = configured_stack(Ipv4Addr::new(192, 168, 7, 1));
        assert!(stack.dns_query("example.com", 40));
        let frame = stack.dev.sent.pop_back().unwrap();
        let dns = query_question(&frame);
        let name_start = DNS_HLEN;
        assert_eq!(dns[name_start], 7);
        assert_eq!(&dns[name_start + 1..name_start + 8], b"example");
        assert_eq!(dns[name_start + 8], 3);
        assert_eq!(&dns[name_start + 9..name_start + 12], b"com");
        assert_eq!(dns[name_start + 12], 0);
    }

    #[test]
    fn answer_resolves_pending_query() {
        let mut stack = configured_stack(Ipv4Addr::new(192, 168, 7, 1));
        assert!(stack.dns_query("example.com", 40));
        assert!(stack.dns_pending());

        let frame = answer_frame(&stack, stack.dns.txid, [93, 184, 216, 34], false);
        stack.dev.incoming.push_back(frame);
        stack.poll(41);

        assert!(!stack.dns_pending());
        assert_eq!(
            stack.dns_take_result(),
            Some(Ipv4Addr::new(93, 184, 216, 34))
        );
    }

    #[test]
    fn compressed_answer_name_is_skipped() {
        let mut stack = configured_stack(Ipv4Addr::new(192, 168, 7, 1));
        assert!(stack.dns_query("example.com", 40));
        let frame = answer_frame(&stack, stack.dns.txid, [1, 2, 3, 4], true);
        stack.dev.incoming.push_back(frame);
        stack.poll(41);
        assert_eq!(stack.dns_take_result(), Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn mismatched_txid_is_ignored() {
        let mut stack = configured_stack(Ipv4Addr::new(192, 168, 7, 1));
        assert!(stack.dns_query("example.com", 40));
        let frame = answer_frame(&stack, stack.dns.txid ^ 0xFFFF, [9, 9, 9, 9], false);
        stack.dev.incoming.push_back(frame);
        stack.poll(41);
        assert!(stack.dns_pending());
        assert_eq!(stack.dns_take_result(), None);
    }

    #[test]
    fn empty_answer_clears_pending() {
        let mut stack = configured_stack(Ipv4Addr::new(192, 168, 7, 1));
        assert!(stack.dns_query("nosuch.host", 40));
        let mut msg = Vec::new();
        msg.extend_from_slice(&stack.dns.txid.to_be_bytes());
        msg.extend_from_slice(&0x8183u16.to_be_bytes()); // NXDOMAIN
        msg.extend_from_slice(&[0; 8]);
        let udp = UdpHeader::build(DNS_SERVER_PORT, DNS_CLIENT_PORT, &msg);
        let ip = Ipv4Header::build(stack.config.dns, stack.config.ip, IPPROTO_UDP, 9, &udp);
        let frame = EthHeader::build(stack.mac, PEER_MAC, ETHERTYPE_IPV4, &ip);
        stack.dev.incoming.push_back(frame);
        stack.poll(41);
        assert!(!stack.dns_pending());
        assert_eq!(stack.dns_take_result(), None);
    }

    #[test]
    fn query_requires_interface_up() {
        let mut stack = NetStack::new(crate::stack::testutil::FakeNic::new(), 100, 0);
        assert!(!stack.dns_query("example.com", 1));
    }
}
