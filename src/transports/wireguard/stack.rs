//! Minimal client-side TCP over raw IPv4 packets.
//!
//! The WireGuard tunnel moves IP packets, not byte streams, so the one
//! TCP connection riding it is driven by hand: a three-way handshake,
//! in-order data with cumulative ACKs, and FIN/RST teardown. Anything
//! fancier (reordering, retransmission) is left to the peer's stack;
//! out-of-order segments are answered with a duplicate ACK and dropped,
//! which makes the sender retransmit.

use etherparse::{IpNumber, Ipv4Header, TcpHeader};
use rand::Rng;
use std::net::Ipv4Addr;

/// Conservative MSS leaving room for IP and TCP headers inside the
/// tunnel MTU
const MSS: usize = 1360;

/// Advertised receive window
const WINDOW: u16 = 65535;

const TTL: u8 = 64;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_PSH: u8 = 0x08;
const FLAG_ACK: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    Closed,
    SynSent,
    Established,
    CloseWait,
}

/// Everything that fell out of processing one inbound packet
#[derive(Default)]
pub(super) struct TcpInput {
    /// Packets to push back through the tunnel
    pub replies: Vec<Vec<u8>>,
    /// In-order application payload, empty when the packet carried none
    pub payload: Vec<u8>,
    /// The peer has closed or reset its half
    pub eof: bool,
}

/// Single client TCP connection over raw IPv4
pub(super) struct VirtualTcp {
    local_addr: Ipv4Addr,
    remote_addr: Ipv4Addr,
    local_port: u16,
    remote_port: u16,
    state: TcpState,
    /// Next sequence number to send
    local_seq: u32,
    /// Next sequence number expected from the peer
    local_ack: u32,
}

impl VirtualTcp {
    pub fn new(local_addr: Ipv4Addr, remote_addr: Ipv4Addr, remote_port: u16) -> VirtualTcp {
        let mut rng = rand::thread_rng();
        VirtualTcp {
            local_addr,
            remote_addr,
            local_port: rng.gen_range(49152..65000),
            remote_port,
            state: TcpState::Closed,
            local_seq: rng.gen(),
            local_ack: 0,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == TcpState::Established
    }

    /// Opens the connection returning the SYN packet to send
    pub fn syn(&mut self) -> Option<Vec<u8>> {
        let packet = self.packet(FLAG_SYN, &[]);
        // The SYN consumes one sequence number
        self.local_seq = self.local_seq.wrapping_add(1);
        self.state = TcpState::SynSent;
        packet
    }

    /// Segments outbound payload into data packets. Returns nothing
    /// unless the connection can currently carry data.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            return Vec::new();
        }

        let count = data.chunks(MSS).count();
        let mut packets = Vec::with_capacity(count);
        for (index, chunk) in data.chunks(MSS).enumerate() {
            // Push on the final segment so the peer delivers promptly
            let flags = if index + 1 == count {
                FLAG_ACK | FLAG_PSH
            } else {
                FLAG_ACK
            };
            if let Some(packet) = self.packet(flags, chunk) {
                packets.push(packet);
            }
            self.local_seq = self.local_seq.wrapping_add(chunk.len() as u32);
        }
        packets
    }

    /// Closes our half returning the FIN packet to send
    pub fn close(&mut self) -> Option<Vec<u8>> {
        match self.state {
            TcpState::Established | TcpState::CloseWait => {
                let packet = self.packet(FLAG_FIN | FLAG_ACK, &[]);
                self.local_seq = self.local_seq.wrapping_add(1);
                self.state = TcpState::Closed;
                packet
            }
            _ => None,
        }
    }

    /// Feeds one inbound IP packet through the state machine
    pub fn handle(&mut self, packet: &[u8]) -> TcpInput {
        let mut input = TcpInput::default();

        let (ip, ip_payload) = match Ipv4Header::from_slice(packet) {
            Ok(value) => value,
            Err(_) => return input,
        };
        if ip.protocol != IpNumber::TCP
            || Ipv4Addr::from(ip.source) != self.remote_addr
            || Ipv4Addr::from(ip.destination) != self.local_addr
        {
            return input;
        }

        let (tcp, payload) = match TcpHeader::from_slice(ip_payload) {
            Ok(value) => value,
            Err(_) => return input,
        };
        if tcp.source_port != self.remote_port || tcp.destination_port != self.local_port {
            return input;
        }

        match self.state {
            TcpState::SynSent => {
                if tcp.rst {
                    self.state = TcpState::Closed;
                    input.eof = true;
                } else if tcp.syn && tcp.ack {
                    self.local_ack = tcp.sequence_number.wrapping_add(1);
                    self.state = TcpState::Established;
                    self.emit(FLAG_ACK, &mut input.replies);
                }
            }
            TcpState::Established => {
                if tcp.rst {
                    self.state = TcpState::Closed;
                    input.eof = true;
                } else if tcp.fin {
                    if tcp.sequence_number == self.local_ack {
                        if !payload.is_empty() {
                            input.payload = payload.to_vec();
                        }
                        self.local_ack = tcp
                            .sequence_number
                            .wrapping_add(payload.len() as u32)
                            .wrapping_add(1);
                        self.state = TcpState::CloseWait;
                        self.emit(FLAG_ACK, &mut input.replies);
                        input.eof = true;
                    } else {
                        // FIN ahead of missing data, re-ACK what we have
                        self.emit(FLAG_ACK, &mut input.replies);
                    }
                } else if !payload.is_empty() {
                    if tcp.sequence_number == self.local_ack {
                        self.local_ack = self.local_ack.wrapping_add(payload.len() as u32);
                        input.payload = payload.to_vec();
                        self.emit(FLAG_ACK, &mut input.replies);
                    } else {
                        // Retransmit or gap, the duplicate ACK tells the
                        // peer where we actually are
                        self.emit(FLAG_ACK, &mut input.replies);
                    }
                }
                // Pure ACKs carry nothing to act on
            }
            TcpState::CloseWait | TcpState::Closed => {
                if tcp.rst {
                    self.state = TcpState::Closed;
                }
            }
        }

        input
    }

    /// Builds a packet with the current sequence numbers and pushes it
    /// onto `replies` when construction succeeds
    fn emit(&self, flags: u8, replies: &mut Vec<Vec<u8>>) {
        if let Some(packet) = self.packet(flags, &[]) {
            replies.push(packet);
        }
    }

    /// Builds one TCP/IPv4 packet. Construction only fails for payload
    /// sizes this connection never produces.
    fn packet(&self, flags: u8, payload: &[u8]) -> Option<Vec<u8>> {
        let mut tcp = TcpHeader::new(self.local_port, self.remote_port, self.local_seq, WINDOW);
        tcp.acknowledgment_number = self.local_ack;
        tcp.fin = flags & FLAG_FIN != 0;
        tcp.syn = flags & FLAG_SYN != 0;
        tcp.rst = flags & FLAG_RST != 0;
        tcp.psh = flags & FLAG_PSH != 0;
        tcp.ack = flags & FLAG_ACK != 0;

        let ip_payload_len = tcp.header_len() as usize + payload.len();
        let ip = Ipv4Header::new(
            ip_payload_len as u16,
            TTL,
            IpNumber::TCP,
            self.local_addr.octets(),
            self.remote_addr.octets(),
        )
        .ok()?;

        tcp.checksum = tcp.calc_checksum_ipv4(&ip, payload).ok()?;

        let mut packet = Vec::with_capacity(20 + ip_payload_len);
        ip.write(&mut packet).ok()?;
        tcp.write(&mut packet).ok()?;
        packet.extend_from_slice(payload);
        Some(packet)
    }
}

#[cfg(test)]
mod test {
    use super::{TcpInput, VirtualTcp};
    use etherparse::{IpNumber, Ipv4Header, TcpHeader};
    use std::net::Ipv4Addr;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 2);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 1);
    const PORT: u16 = 8888;

    /// Builds a packet as the remote peer would send it
    fn peer_packet(
        tcp_config: impl FnOnce(&mut TcpHeader),
        local_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut tcp = TcpHeader::new(PORT, local_port, 9000, 65535);
        tcp_config(&mut tcp);

        let ip = Ipv4Header::new(
            (tcp.header_len() as usize + payload.len()) as u16,
            64,
            IpNumber::TCP,
            REMOTE.octets(),
            LOCAL.octets(),
        )
        .unwrap();
        tcp.checksum = tcp.calc_checksum_ipv4(&ip, payload).unwrap();

        let mut packet = Vec::new();
        ip.write(&mut packet).unwrap();
        tcp.write(&mut packet).unwrap();
        packet.extend_from_slice(payload);
        packet
    }

    /// Parses a generated packet back into its TCP header and payload
    fn parse(packet: &[u8]) -> (TcpHeader, Vec<u8>) {
        let (ip, rest) = Ipv4Header::from_slice(packet).unwrap();
        assert_eq!(ip.protocol, IpNumber::TCP);
        let (tcp, payload) = TcpHeader::from_slice(rest).unwrap();
        (tcp, payload.to_vec())
    }

    /// Drives a connection through the three-way handshake
    fn established() -> (VirtualTcp, u32) {
        let mut tcp = VirtualTcp::new(LOCAL, REMOTE, PORT);
        let syn = tcp.syn().unwrap();
        let (syn_header, _) = parse(&syn);
        assert!(syn_header.syn);
        assert!(!syn_header.ack);
        assert_eq!(syn_header.source_port, tcp.local_port);

        let synack = peer_packet(
            |header| {
                header.syn = true;
                header.ack = true;
                header.acknowledgment_number = syn_header.sequence_number.wrapping_add(1);
            },
            tcp.local_port,
            &[],
        );

        let input = tcp.handle(&synack);
        assert!(tcp.is_established());
        assert_eq!(input.replies.len(), 1);
        let (ack, _) = parse(&input.replies[0]);
        assert!(ack.ack);
        assert_eq!(ack.acknowledgment_number, 9001);

        (tcp, 9001)
    }

    /// Tests the handshake plus in-order data delivery and ACK movement
    #[test]
    fn test_handshake_and_data() {
        let (mut tcp, peer_seq) = established();
        let local_port = tcp.local_port;

        let data = peer_packet(
            |header| {
                header.ack = true;
                header.sequence_number = peer_seq;
                header.psh = true;
            },
            local_port,
            b"hello there",
        );

        let input = tcp.handle(&data);
        assert_eq!(input.payload, b"hello there");
        assert!(!input.eof);
        let (ack, _) = parse(&input.replies[0]);
        assert_eq!(
            ack.acknowledgment_number,
            peer_seq.wrapping_add(b"hello there".len() as u32)
        );
    }

    /// Tests that out-of-order segments are dropped with a duplicate
    /// ACK instead of being delivered
    #[test]
    fn test_out_of_order_dropped() {
        let (mut tcp, peer_seq) = established();
        let local_port = tcp.local_port;

        let future = peer_packet(
            |header| {
                header.ack = true;
                header.sequence_number = peer_seq.wrapping_add(500);
            },
            local_port,
            b"early",
        );

        let input = tcp.handle(&future);
        assert!(input.payload.is_empty());
        let (ack, _) = parse(&input.replies[0]);
        // The duplicate ACK still points at the gap
        assert_eq!(ack.acknowledgment_number, peer_seq);
    }

    /// Tests that segmentation respects the MSS and marks the final
    /// segment with a push
    #[test]
    fn test_push_segmentation() {
        let (mut tcp, _) = established();

        let payload = vec![7u8; super::MSS + 100];
        let packets = tcp.push(&payload);
        assert_eq!(packets.len(), 2);

        let (first, first_payload) = parse(&packets[0]);
        let (second, second_payload) = parse(&packets[1]);
        assert_eq!(first_payload.len(), super::MSS);
        assert_eq!(second_payload.len(), 100);
        assert!(!first.psh);
        assert!(second.psh);
        assert_eq!(
            second.sequence_number,
            first.sequence_number.wrapping_add(super::MSS as u32)
        );
    }

    /// Tests FIN teardown: payload delivered, FIN acknowledged, eof
    /// surfaced, and no further data accepted
    #[test]
    fn test_fin_teardown() {
        let (mut tcp, peer_seq) = established();
        let local_port = tcp.local_port;

        let fin = peer_packet(
            |header| {
                header.ack = true;
                header.fin = true;
                header.sequence_number = peer_seq;
            },
            local_port,
            b"last",
        );

        let input = tcp.handle(&fin);
        assert_eq!(input.payload, b"last");
        assert!(input.eof);
        let (ack, _) = parse(&input.replies[0]);
        // ACK covers the payload and the FIN itself
        assert_eq!(ack.acknowledgment_number, peer_seq.wrapping_add(5));

        // Our half can still close gracefully
        let fin_packet = tcp.close().unwrap();
        let (header, _) = parse(&fin_packet);
        assert!(header.fin);
        assert!(tcp.push(b"more").is_empty());
    }

    /// Tests that a reset drops the connection immediately
    #[test]
    fn test_reset() {
        let (mut tcp, peer_seq) = established();
        let local_port = tcp.local_port;

        let rst = peer_packet(
            |header| {
                header.rst = true;
                header.sequence_number = peer_seq;
            },
            local_port,
            &[],
        );

        let input: TcpInput = tcp.handle(&rst);
        assert!(input.eof);
        assert!(!tcp.is_established());
        assert!(tcp.push(b"more").is_empty());
    }
}
