//! Wire formats: addresses, header codecs, and checksums.
//!
//! Headers are built and parsed with explicit byte offsets rather than
//! `repr(packed)` casts, so there is no unaligned access and parsing a
//! truncated packet is an `Option`, not undefined behavior. All
//! multi-byte fields are big-endian on the wire.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// IPv4 protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;
/// IPv4 protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

/// Ethernet header length.
pub const ETH_HLEN: usize = 14;
/// IPv4 header length (no options).
pub const IPV4_HLEN: usize = 20;
/// UDP header length.
pub const UDP_HLEN: usize = 8;
/// TCP header length (no options; data offset is always 5).
pub const TCP_HLEN: usize = 20;
/// ARP packet length for Ethernet/IPv4.
pub const ARP_LEN: usize = 28;

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// An Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The broadcast address.
    pub const BROADCAST: Self = Self([0xFF; 6]);
    /// The all-zero address.
    pub const ZERO: Self = Self([0; 6]);
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// An IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// The unset address `0.0.0.0`.
    pub const UNSET: Self = Self([0; 4]);
    /// The limited broadcast address.
    pub const BROADCAST: Self = Self([0xFF; 4]);

    /// Builds an address from four octets.
    #[must_use]
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    /// Whether this is `0.0.0.0`.
    #[must_use]
    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }

    /// The address as a host-order integer, for masking.
    #[must_use]
    pub fn to_bits(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Whether `self` and `other` share the subnet given by `mask`.
    #[must_use]
    pub fn same_subnet(self, other: Self, mask: Self) -> bool {
        self.to_bits() & mask.to_bits() == other.to_bits() & mask.to_bits()
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = self.0;
        write!(f, "{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3])
    }
}

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

pub(crate) fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Standard 16-bit one's-complement checksum (IPv4 header checksum).
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(0, data))
}

/// TCP checksum: the pseudo-header `{src, dst, 0, proto, len}` summed
/// ahead of the segment itself.
#[must_use]
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.0);
    pseudo[4..8].copy_from_slice(&dst.0);
    pseudo[9] = IPPROTO_TCP;
    put_u16(&mut pseudo, 10, segment.len() as u16);
    fold(sum_words(sum_words(0, &pseudo), segment))
}

// ---------------------------------------------------------------------------
// Ethernet
// ---------------------------------------------------------------------------

/// A parsed Ethernet header.
#[derive(Debug, Clone, Copy)]
pub struct EthHeader {
    /// Destination hardware address.
    pub dst: MacAddr,
    /// Source hardware address.
    pub src: MacAddr,
    /// Payload EtherType.
    pub ethertype: u16,
}

impl EthHeader {
    /// Splits `frame` into its header and payload.
    #[must_use]
    pub fn parse(frame: &[u8]) -> Option<(Self, &[u8])> {
        if frame.len() < ETH_HLEN {
            return None;
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        Some((
            Self {
                dst: MacAddr(dst),
                src: MacAddr(src),
                ethertype: get_u16(frame, 12),
            },
            &frame[ETH_HLEN..],
        ))
    }

    /// Builds a frame: header followed by `payload`.
    #[must_use]
    pub fn build(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(ETH_HLEN + payload.len());
        frame.extend_from_slice(&dst.0);
        frame.extend_from_slice(&src.0);
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }
}

// ---------------------------------------------------------------------------
// ARP
// ---------------------------------------------------------------------------

/// ARP request opcode.
pub const ARP_OP_REQUEST: u16 = 1;
/// ARP reply opcode.
pub const ARP_OP_REPLY: u16 = 2;

/// A parsed Ethernet/IPv4 ARP packet.
#[derive(Debug, Clone, Copy)]
pub struct ArpPacket {
    /// Operation: request or reply.
    pub oper: u16,
    /// Sender hardware address.
    pub sha: MacAddr,
    /// Sender protocol address.
    pub spa: Ipv4Addr,
    /// Target hardware address.
    pub tha: MacAddr,
    /// Target protocol address.
    pub tpa: Ipv4Addr,
}

impl ArpPacket {
    /// Parses an ARP payload, rejecting anything that is not
    /// Ethernet/IPv4 with 6/4 address lengths.
    #[must_use]
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < ARP_LEN {
            return None;
        }
        if get_u16(payload, 0) != 1 || get_u16(payload, 2) != ETHERTYPE_IPV4 {
            return None;
        }
        if payload[4] != 6 || payload[5] != 4 {
            return None;
        }
        let mut sha = [0u8; 6];
        let mut tha = [0u8; 6];
        let mut spa = [0u8; 4];
        let mut tpa = [0u8; 4];
        sha.copy_from_slice(&payload[8..14]);
        spa.copy_from_slice(&payload[14..18]);
        tha.copy_from_slice(&payload[18..24]);
        tpa.copy_from_slice(&payload[24..28]);
        Some(Self {
            oper: get_u16(payload, 6),
            sha: MacAddr(sha),
            spa: Ipv4Addr(spa),
            tha: MacAddr(tha),
            tpa: Ipv4Addr(tpa),
        })
    }

    /// Serializes the packet.
    #[must_use]
    pub fn build(&self) -> [u8; ARP_LEN] {
        let mut out = [0u8; ARP_LEN];
        put_u16(&mut out, 0, 1);
        put_u16(&mut out, 2, ETHERTYPE_IPV4);
        out[4] = 6;
        out[5] = 4;
        put_u16(&mut out, 6, self.oper);
        out[8..14].copy_from_slice(&self.sha.0);
        out[14..18].copy_from_slice(&self.spa.0);
        out[18..24].copy_from_slice(&self.tha.0);
        out[24..28].copy_from_slice(&self.tpa.0);
        out
    }
}

// ---------------------------------------------------------------------------
// IPv4
// ---------------------------------------------------------------------------

/// A parsed IPv4 header.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    /// Layer-4 protocol number.
    pub proto: u8,
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Parses the header, returning it together with the layer-4
    /// payload (bounded by the header's total length).
    #[must_use]
    pub fn parse(packet: &[u8]) -> Option<(Self, &[u8])> {
        if packet.len() < IPV4_HLEN || packet[0] >> 4 != 4 {
            return None;
        }
        let header_len = usize::from(packet[0] & 0x0F) * 4;
        if header_len < IPV4_HLEN || packet.len() < header_len {
            return None;
        }
        let total_len = usize::from(get_u16(packet, 2)).min(packet.len());
        if total_len < header_len {
            return None;
        }
        let mut src = [0u8; 4];
        let mut dst = [0u8; 4];
        src.copy_from_slice(&packet[12..16]);
        dst.copy_from_slice(&packet[16..20]);
        Some((
            Self {
                proto: packet[9],
                src: Ipv4Addr(src),
                dst: Ipv4Addr(dst),
            },
            &packet[header_len..total_len],
        ))
    }

    /// Builds a header + payload packet: version 4, no options, DF set,
    /// TTL 64, and a computed header checksum.
    #[must_use]
    pub fn build(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, id: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(IPV4_HLEN + payload.len());
        packet.resize(IPV4_HLEN, 0);
        packet[0] = 0x45;
        put_u16(&mut packet, 2, (IPV4_HLEN + payload.len()) as u16);
        put_u16(&mut packet, 4, id);
        put_u16(&mut packet, 6, 0x4000); // DF, fragment offset 0
        packet[8] = 64;
        packet[9] = proto;
        packet[12..16].copy_from_slice(&src.0);
        packet[16..20].copy_from_slice(&dst.0);
        let sum = checksum(&packet[..IPV4_HLEN]);
        put_u16(&mut packet, 10, sum);
        packet.extend_from_slice(payload);
        packet
    }
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

/// A parsed UDP header.
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
}

impl UdpHeader {
    /// Parses a UDP datagram into its header and payload.
    #[must_use]
    pub fn parse(datagram: &[u8]) -> Option<(Self, &[u8])> {
        if datagram.len() < UDP_HLEN {
            return None;
        }
        let len = usize::from(get_u16(datagram, 4));
        if len < UDP_HLEN || datagram.len() < len {
            return None;
        }
        Some((
            Self {
                src_port: get_u16(datagram, 0),
                dst_port: get_u16(datagram, 2),
            },
            &datagram[UDP_HLEN..len],
        ))
    }

    /// Builds a datagram with a zero checksum (legal for IPv4).
    #[must_use]
    pub fn build(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(UDP_HLEN + payload.len());
        datagram.extend_from_slice(&src_port.to_be_bytes());
        datagram.extend_from_slice(&dst_port.to_be_bytes());
        datagram.extend_from_slice(&((UDP_HLEN + payload.len()) as u16).to_be_bytes());
        datagram.extend_from_slice(&0u16.to_be_bytes());
        datagram.extend_from_slice(payload);
        datagram
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

bitflags! {
    /// TCP header flags (low six bits of the offset/flags word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        /// Sender is done sending.
        const FIN = 1 << 0;
        /// Synchronize sequence numbers.
        const SYN = 1 << 1;
        /// Reset the connection.
        const RST = 1 << 2;
        /// Push buffered data to the application.
        const PSH = 1 << 3;
        /// The acknowledgment field is valid.
        const ACK = 1 << 4;
        /// Urgent pointer is valid.
        const URG = 1 << 5;
    }
}

/// A parsed TCP header.
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Sequence number of the first payload byte.
    pub seq: u32,
    /// Acknowledgment number.
    pub ack: u32,
    /// Header flags.
    pub flags: TcpFlags,
    /// Advertised receive window.
    pub window: u16,
}

impl TcpHeader {
    /// Parses a TCP segment into its header and payload, honoring the
    /// data offset.
    #[must_use]
    pub fn parse(segment: &[u8]) -> Option<(Self, &[u8])> {
        if segment.len() < TCP_HLEN {
            return None;
        }
        let header_len = usize::from(segment[12] >> 4) * 4;
        if header_len < TCP_HLEN || segment.len() < header_len {
            return None;
        }
        Some((
            Self {
                src_port: get_u16(segment, 0),
                dst_port: get_u16(segment, 2),
                seq: get_u32(segment, 4),
                ack: get_u32(segment, 8),
                flags: TcpFlags::from_bits_truncate(segment[13]),
                window: get_u16(segment, 14),
            },
            &segment[header_len..],
        ))
    }

    /// Builds a segment with data offset 5 and a checksum over the
    /// pseudo-header and payload.
    #[must_use]
    pub fn build(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        window: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut segment = Vec::with_capacity(TCP_HLEN + payload.len());
        segment.resize(TCP_HLEN, 0);
        put_u16(&mut segment, 0, src_port);
        put_u16(&mut segment, 2, dst_port);
        put_u32(&mut segment, 4, seq);
        put_u32(&mut segment, 8, ack);
        segment[12] = 5 << 4;
        segment[13] = flags.bits();
        put_u16(&mut segment, 14, window);
        segment.extend_from_slice(payload);
        let sum = tcp_checksum(src, dst, &segment);
        put_u16(&mut segment, 16, sum);
        segment
    }
}
