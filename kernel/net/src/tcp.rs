//! Single-connection TCP.
//!
//! One connection at a time, client-only: SYN out, data both ways, FIN
//! either way. Received data is accepted only when it starts exactly at
//! `rcv_nxt`; out-of-order and overlapping segments are dropped and the
//! current `rcv_nxt` is re-acknowledged. That keeps the receiver a
//! plain linear buffer and is a deliberate simplification, not a bug —
//! the sender's retransmission fills any gap. Loss recovery on our side
//! is a single-segment retransmit: after one second without an ACK the
//! last segment is resent with `snd_nxt` rewound to its sequence.

use alloc::boxed::Box;
use alloc::vec;

use crate::stack::NetStack;
use crate::wire::{IPPROTO_TCP, Ipv4Addr, TcpFlags, TcpHeader};
use crate::NetDevice;

/// Receive buffer size.
const RECV_BUF: usize = 65536;

/// Largest payload carried in one segment (and kept for retransmit).
const MAX_SEGMENT: usize = 1460;

/// Advertised receive window.
const WINDOW: u16 = 4096;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// No connection.
    Closed,
    /// SYN sent, waiting for SYN+ACK.
    SynSent,
    /// Three-way handshake done.
    Established,
    /// We sent FIN and await the peer's.
    FinWait,
    /// Peer sent FIN; data can still drain.
    CloseWait,
}

/// The single TCP connection.
pub(crate) struct TcpConn {
    pub state: TcpState,
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
    pub src_port: u16,
    pub snd_nxt: u32,
    pub snd_una: u32,
    pub rcv_nxt: u32,
    recv_buf: Box<[u8]>,
    pub recv_len: usize,
    pub recv_read: usize,
    last_payload: Box<[u8]>,
    pub last_len: usize,
    pub last_flags: TcpFlags,
    pub last_seq: u32,
    pub last_send_tick: u64,
    pub waiting_ack: bool,
}

impl TcpConn {
    pub fn new() -> Self {
        Self {
            state: TcpState::Closed,
            dest_ip: Ipv4Addr::UNSET,
            dest_port: 0,
            src_port: 0,
            snd_nxt: 0,
            snd_una: 0,
            rcv_nxt: 0,
            recv_buf: vec![0; RECV_BUF].into_boxed_slice(),
            recv_len: 0,
            recv_read: 0,
            last_payload: vec![0; MAX_SEGMENT].into_boxed_slice(),
            last_len: 0,
            last_flags: TcpFlags::empty(),
            last_seq: 0,
            last_send_tick: 0,
            waiting_ack: false,
        }
    }
}

impl<D: NetDevice> NetStack<D> {
    /// Opens a connection to `ip:port`. The source port and initial
    /// sequence number are derived from the tick counter.
    ///
    /// Returns `false` when the interface is down. `true` means the SYN
    /// is on the wire (or queued behind an ARP resolution).
    pub fn tcp_connect(&mut self, ip: Ipv4Addr, port: u16, now: u64) -> bool {
        if !self.is_up() {
            return false;
        }
        let conn = &mut self.tcp;
        conn.dest_ip = ip;
        conn.dest_port = port;
        conn.src_port = (1024 + now % 40000) as u16;
        conn.snd_nxt = (now ^ 0xA5_A5C3) as u32;
        conn.snd_una = conn.snd_nxt;
        conn.rcv_nxt = 0;
        conn.recv_len = 0;
        conn.recv_read = 0;
        conn.waiting_ack = false;
        conn.state = TcpState::SynSent;
        self.tcp_send_segment(TcpFlags::SYN, &[], now);
        true
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn tcp_is_established(&self) -> bool {
        self.tcp.state == TcpState::Established
    }

    /// Whether the connection is gone (closed or peer-initiated
    /// close with no more data expected).
    #[must_use]
    pub fn tcp_is_closed(&self) -> bool {
        matches!(self.tcp.state, TcpState::Closed | TcpState::CloseWait)
    }

    /// Current connection state.
    #[must_use]
    pub fn tcp_state(&self) -> TcpState {
        self.tcp.state
    }

    /// Sends `data` as one PSH segment. Data longer than one segment is
    /// truncated to [`MAX_SEGMENT`] bytes; the caller loops.
    /// Returns the number of bytes handed to the connection.
    pub fn tcp_send(&mut self, data: &[u8], now: u64) -> usize {
        if self.tcp.state != TcpState::Established || data.is_empty() {
            return 0;
        }
        let len = data.len().min(MAX_SEGMENT);
        self.tcp_send_segment(TcpFlags::PSH | TcpFlags::ACK, &data[..len], now);
        len
    }

    /// Drains received bytes into `out`, returning the count.
    pub fn tcp_recv(&mut self, out: &mut [u8]) -> usize {
        let conn = &mut self.tcp;
        let available = (conn.recv_len - conn.recv_read).min(out.len());
        if available == 0 {
            return 0;
        }
        out[..available].copy_from_slice(&conn.recv_buf[conn.recv_read..conn.recv_read + available]);
        conn.recv_read += available;
        available
    }

    /// Starts an orderly close from the established state.
    pub fn tcp_close(&mut self, now: u64) {
        if self.tcp.state == TcpState::Established {
            self.tcp_send_segment(TcpFlags::FIN | TcpFlags::ACK, &[], now);
            self.tcp.state = TcpState::FinWait;
        }
    }

    /// Builds and transmits one segment, recording it for retransmit.
    fn tcp_send_segment(&mut self, flags: TcpFlags, payload: &[u8], now: u64) {
        let conn = &self.tcp;
        let segment = TcpHeader::build(
            self.config.ip,
            conn.dest_ip,
            conn.src_port,
            conn.dest_port,
            conn.snd_nxt,
            conn.rcv_nxt,
            flags,
            WINDOW,
            payload,
        );
        let dest_ip = conn.dest_ip;
        self.send_ipv4(dest_ip, IPPROTO_TCP, &segment);

        let conn = &mut self.tcp;
        conn.last_send_tick = now;
        conn.last_flags = flags;
        conn.last_seq = conn.snd_nxt;
        conn.last_len = payload.len();
        if !payload.is_empty() {
            conn.last_payload[..payload.len()].copy_from_slice(payload);
        }
        if flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
            conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
        } else {
            conn.snd_nxt = conn.snd_nxt.wrapping_add(payload.len() as u32);
        }
        if flags.intersects(TcpFlags::SYN | TcpFlags::FIN) || !payload.is_empty() {
            conn.waiting_ack = true;
        }
    }

    /// Handles a received TCP segment addressed to us.
    pub(crate) fn handle_tcp(&mut self, segment: &[u8], src_ip: Ipv4Addr, now: u64) {
        let Some((header, data)) = TcpHeader::parse(segment) else {
            return;
        };

        match self.tcp.state {
            TcpState::SynSent => {
                let expected = header.flags.contains(TcpFlags::SYN | TcpFlags::ACK)
                    && src_ip == self.tcp.dest_ip
                    && header.src_port == self.tcp.dest_port
                    && header.dst_port == self.tcp.src_port
                    && header.ack == self.tcp.snd_nxt;
                if expected {
                    self.tcp.rcv_nxt = header.seq.wrapping_add(1);
                    self.tcp.snd_una = header.ack;
                    self.tcp.waiting_ack = false;
                    self.tcp.state = TcpState::Established;
                    self.tcp_send_segment(TcpFlags::ACK, &[], now);
                }
            }
            TcpState::Established | TcpState::FinWait => {
                if src_ip != self.tcp.dest_ip
                    || header.src_port != self.tcp.dest_port
                    || header.dst_port != self.tcp.src_port
                {
                    return;
                }
                if header.flags.contains(TcpFlags::ACK) {
                    if header.ack > self.tcp.snd_una {
                        self.tcp.snd_una = header.ack;
                    }
                    if header.ack >= self.tcp.snd_nxt {
                        self.tcp.waiting_ack = false;
                    }
                }

                let mut accepted = 0usize;
                if !data.is_empty() && header.seq == self.tcp.rcv_nxt {
                    let conn = &mut self.tcp;
                    let space = RECV_BUF - conn.recv_len;
                    accepted = data.len().min(space);
                    conn.recv_buf[conn.recv_len..conn.recv_len + accepted]
                        .copy_from_slice(&data[..accepted]);
                    conn.recv_len += accepted;
                    conn.rcv_nxt = conn.rcv_nxt.wrapping_add(accepted as u32);
                    self.tcp_send_segment(TcpFlags::ACK, &[], now);
                } else if !data.is_empty() {
                    // Out-of-order or duplicate: drop, re-ACK rcv_nxt.
                    self.tcp_send_segment(TcpFlags::ACK, &[], now);
                }

                if header.flags.contains(TcpFlags::FIN) {
                    let conn = &mut self.tcp;
                    conn.rcv_nxt = header.seq.wrapping_add(accepted as u32).wrapping_add(1);
                    let next = if conn.state == TcpState::Established {
                        TcpState::CloseWait
                    } else {
                        TcpState::Closed
                    };
                    self.tcp_send_segment(TcpFlags::ACK, &[], now);
                    self.tcp.state = next;
                }
            }
            _ => {}
        }
    }

    /// Retransmits the last segment after one silent second.
    pub(crate) fn tcp_poll_retransmit(&mut self, now: u64) {
        let conn = &self.tcp;
        let armed = conn.state == TcpState::SynSent || conn.waiting_ack;
        if !armed || now.wrapping_sub(conn.last_send_tick) <= self.ticks_per_sec {
            return;
        }

        let flags = conn.last_flags;
        let len = conn.last_len;
        self.tcp.snd_nxt = self.tcp.last_seq;
        if flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
            self.tcp_send_segment(flags, &[], now);
        } else if len > 0 {
            let mut payload = [0u8; MAX_SEGMENT];
            payload[..len].copy_from_slice(&self.tcp.last_payload[..len]);
            self.tcp_send_segment(flags, &payload[..len], now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::testutil::{configured_stack, FakeNic, PEER_MAC};
    use crate::wire::{ETHERTYPE_IPV4, EthHeader, Ipv4Header, tcp_checksum};

    const TPS: u64 = 100;
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 7, 3);
    const PEER_PORT: u16 = 80;

    /// Pops the most recent frame and returns the parsed TCP header
    /// and payload.
    fn last_tcp(stack: &mut NetStack<FakeNic>) -> (TcpHeader, Vec<u8>) {
        let frame = stack.dev.sent.pop_back().expect("no frame sent");
        let (_, ip) = EthHeader::parse(&frame).unwrap();
        let (ip_header, segment) = Ipv4Header::parse(ip).unwrap();
        assert_eq!(ip_header.proto, IPPROTO_TCP);
        // Every transmitted segment must carry a valid checksum.
        assert_eq!(tcp_checksum(ip_header.src, ip_header.dst, segment), 0);
        let (header, payload) = TcpHeader::parse(segment).unwrap();
        (header, payload.to_vec())
    }

    /// Injects a segment from the peer.
    fn peer_send(
        stack: &mut NetStack<FakeNic>,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) {
        let segment = TcpHeader::build(
            PEER_IP,
            stack.config.ip,
            PEER_PORT,
            stack.tcp.src_port,
            seq,
            ack,
            flags,
            4096,
            payload,
        );
        let ip = Ipv4Header::build(PEER_IP, stack.config.ip, IPPROTO_TCP, 1, &segment);
        let frame = EthHeader::build(stack.mac, PEER_MAC, ETHERTYPE_IPV4, &ip);
        stack.dev.incoming.push_back(frame);
    }

    /// Runs the handshake and returns (stack, server ISN).
    fn established() -> (NetStack<FakeNic>, u32) {
        let mut stack = configured_stack(PEER_IP);
        assert!(stack.tcp_connect(PEER_IP, PEER_PORT, 7));
        let (syn, _) = last_tcp(&mut stack);
        assert!(syn.flags.contains(TcpFlags::SYN));

        let server_isn = 90_000;
        peer_send(
            &mut stack,
            server_isn,
            syn.seq.wrapping_add(1),
            TcpFlags::SYN | TcpFlags::ACK,
            &[],
        );
        stack.poll(8);
        assert!(stack.tcp_is_established());

        let (ack, _) = last_tcp(&mut stack);
        assert_eq!(ack.flags, TcpFlags::ACK);
        assert_eq!(ack.ack, server_isn + 1);
        (stack, server_isn)
    }

    #[test]
    fn handshake_reaches_established() {
        established();
    }

    #[test]
    fn connect_requires_interface_up() {
        let mut stack = NetStack::new(FakeNic::new(), TPS, 0);
        assert!(!stack.tcp_connect(PEER_IP, 80, 1));
    }

    #[test]
    fn send_and_receive_payload() {
        let (mut stack, server_isn) = established();

        assert_eq!(stack.tcp_send(b"HELLO", 10), 5);
        let (header, payload) = last_tcp(&mut stack);
        assert!(header.flags.contains(TcpFlags::PSH | TcpFlags::ACK));
        assert_eq!(payload, b"HELLO");

        // Peer ACKs our data and sends its own.
        let ack = stack.tcp.snd_nxt;
        peer_send(
            &mut stack,
            server_isn + 1,
            ack,
            TcpFlags::PSH | TcpFlags::ACK,
            b"WORLD",
        );
        stack.poll(11);
        assert!(!stack.tcp.waiting_ack);

        let mut buf = [0u8; 32];
        let n = stack.tcp_recv(&mut buf);
        assert_eq!(&buf[..n], b"WORLD");

        // The inbound data was ACKed at the advanced rcv_nxt.
        let (ack, _) = last_tcp(&mut stack);
        assert_eq!(ack.ack, server_isn + 1 + 5);
    }

    #[test]
    fn out_of_order_segment_dropped_and_reacked() {
        let (mut stack, server_isn) = established();
        let expected = stack.tcp.rcv_nxt;

        // Segment 10 bytes ahead of rcv_nxt must not be buffered.
        let ack = stack.tcp.snd_nxt;
        peer_send(
            &mut stack,
            server_isn + 11,
            ack,
            TcpFlags::ACK,
            b"FUTURE",
        );
        stack.poll(12);

        let mut buf = [0u8; 16];
        assert_eq!(stack.tcp_recv(&mut buf), 0);
        let (ack, _) = last_tcp(&mut stack);
        assert_eq!(ack.ack, expected, "must re-ACK the contiguous edge");
    }

    #[test]
    fn syn_retransmits_after_timeout_and_still_connects() {
        let mut stack = configured_stack(PEER_IP);
        assert!(stack.tcp_connect(PEER_IP, PEER_PORT, 10));
        let (syn1, _) = last_tcp(&mut stack);

        // Within one second: nothing.
        stack.poll(10 + TPS);
        assert!(stack.dev.sent.is_empty());

        // Past one second: the SYN is resent with the same sequence.
        stack.poll(10 + TPS + 5);
        let (syn2, _) = last_tcp(&mut stack);
        assert!(syn2.flags.contains(TcpFlags::SYN));
        assert_eq!(syn2.seq, syn1.seq);

        // The late SYN+ACK still completes the handshake.
        peer_send(
            &mut stack,
            4242,
            syn1.seq.wrapping_add(1),
            TcpFlags::SYN | TcpFlags::ACK,
            &[],
        );
        stack.poll(10 + TPS + 6);
        assert!(stack.tcp_is_established());
    }

    #[test]
    fn data_retransmits_payload_with_rewound_sequence() {
        let (mut stack, _) = established();
        stack.tcp_send(b"important", 20);
        let (first, _) = last_tcp(&mut stack);

        stack.poll(20 + TPS + 1);
        let (again, payload) = last_tcp(&mut stack);
        assert_eq!(again.seq, first.seq);
        assert_eq!(payload, b"important");
        assert!(stack.tcp.waiting_ack);
    }

    #[test]
    fn ack_stops_retransmission() {
        let (mut stack, server_isn) = established();
        stack.tcp_send(b"data", 20);
        let _ = last_tcp(&mut stack);

        let ack = stack.tcp.snd_nxt;
        peer_send(&mut stack, server_isn + 1, ack, TcpFlags::ACK, &[]);
        stack.poll(21);
        assert!(!stack.tcp.waiting_ack);

        stack.poll(20 + 2 * TPS);
        assert!(stack.dev.sent.is_empty(), "no retransmit after ACK");
    }

    #[test]
    fn active_close_walks_fin_states() {
        let (mut stack, server_isn) = established();
        stack.tcp_close(30);
        let (fin, _) = last_tcp(&mut stack);
        assert!(fin.flags.contains(TcpFlags::FIN));
        assert_eq!(stack.tcp_state(), TcpState::FinWait);

        // Peer ACKs our FIN and sends its own.
        let ack = stack.tcp.snd_nxt;
        peer_send(
            &mut stack,
            server_isn + 1,
            ack,
            TcpFlags::FIN | TcpFlags::ACK,
            &[],
        );
        stack.poll(31);
        assert_eq!(stack.tcp_state(), TcpState::Closed);
        assert!(stack.tcp_is_closed());

        let (ack, _) = last_tcp(&mut stack);
        assert_eq!(ack.ack, server_isn + 2);
    }

    #[test]
    fn passive_close_enters_close_wait() {
        let (mut stack, server_isn) = established();
        let ack = stack.tcp.snd_nxt;
        peer_send(
            &mut stack,
            server_isn + 1,
            ack,
            TcpFlags::FIN | TcpFlags::ACK,
            &[],
        );
        stack.poll(40);
        assert_eq!(stack.tcp_state(), TcpState::CloseWait);
        assert!(stack.tcp_is_closed());
    }

    #[test]
    fn fin_with_data_drains_before_closing() {
        let (mut stack, server_isn) = established();
        let ack = stack.tcp.snd_nxt;
        peer_send(
            &mut stack,
            server_isn + 1,
            ack,
            TcpFlags::FIN | TcpFlags::PSH | TcpFlags::ACK,
            b"tail",
        );
        stack.poll(50);
        assert_eq!(stack.tcp_state(), TcpState::CloseWait);
        let mut buf = [0u8; 8];
        let n = stack.tcp_recv(&mut buf);
        assert_eq!(&buf[..n], b"tail");
        // rcv_nxt covers data + FIN.
        assert_eq!(stack.tcp.rcv_nxt, server_isn + 1 + 4 + 1);
    }

    #[test]
    fn oversized_send_is_clamped_to_one_segment() {
        let (mut stack, _) = established();
        let big = vec![0x41u8; MAX_SEGMENT + 500];
        assert_eq!(stack.tcp_send(&big, 60), MAX_SEGMENT);
        let (_, payload) = last_tcp(&mut stack);
        assert_eq!(payload.len(), MAX_SEGMENT);
    }
}
