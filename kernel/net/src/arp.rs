//! ARP: neighbor cache and request/reply handling.

use crate::stack::NetStack;
use crate::wire::{
    ARP_OP_REPLY, ARP_OP_REQUEST, ArpPacket, ETHERTYPE_ARP, Ipv4Addr, MacAddr,
};
use crate::NetDevice;

/// Fixed cache size; at desktop scale eight neighbors is plenty.
const CACHE_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddr,
    last_seen: u64,
    valid: bool,
}

/// Fixed-size IP-to-MAC cache.
///
/// Replacement is "first invalid slot, else slot 0"; no LRU is needed
/// at this size.
#[derive(Debug, Default)]
pub(crate) struct ArpCache {
    entries: [ArpEntry; CACHE_SIZE],
}

impl ArpCache {
    pub fn update(&mut self, ip: Ipv4Addr, mac: MacAddr, now: u64) {
        let slot = self
            .entries
            .iter()
            .position(|e| e.valid && e.ip == ip)
            .or_else(|| self.entries.iter().position(|e| !e.valid))
            .unwrap_or(0);
        self.entries[slot] = ArpEntry {
            ip,
            mac,
            last_seen: now,
            valid: true,
        };
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.entries
            .iter()
            .find(|e| e.valid && e.ip == ip)
            .map(|e| e.mac)
    }
}

impl<D: NetDevice> NetStack<D> {
    /// Broadcasts a who-has request for `target_ip`.
    pub(crate) fn arp_send_request(&mut self, target_ip: Ipv4Addr) {
        let pkt = ArpPacket {
            oper: ARP_OP_REQUEST,
            sha: self.mac,
            spa: self.config.ip,
            tha: MacAddr::ZERO,
            tpa: target_ip,
        };
        self.send_frame(MacAddr::BROADCAST, ETHERTYPE_ARP, &pkt.build());
    }

    fn arp_send_reply(&mut self, target_mac: MacAddr, target_ip: Ipv4Addr) {
        let pkt = ArpPacket {
            oper: ARP_OP_REPLY,
            sha: self.mac,
            spa: self.config.ip,
            tha: target_mac,
            tpa: target_ip,
        };
        self.send_frame(target_mac, ETHERTYPE_ARP, &pkt.build());
    }

    /// Handles a received ARP payload: replies cache the sender,
    /// requests for our address are answered.
    pub(crate) fn handle_arp(&mut self, payload: &[u8], now: u64) {
        let Some(pkt) = ArpPacket::parse(payload) else {
            return;
        };
        match pkt.oper {
            ARP_OP_REPLY => self.arp.update(pkt.spa, pkt.sha, now),
            ARP_OP_REQUEST => {
                if !self.config.ip.is_unset() && pkt.tpa == self.config.ip {
                    self.arp_send_reply(pkt.sha, pkt.spa);
                }
            }
            _ => {}
        }
    }
}
