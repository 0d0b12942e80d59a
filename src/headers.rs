//! IPv4, TCP and UDP header encoding and the internet checksum.
//!
//! Every encoder here is a pure function of its arguments. Only the IPv4
//! header carries a computed checksum; TCP and UDP checksums are left zero and
//! filled in further down the stack.

use std::{fmt, net::Ipv4Addr};

use clap::ValueEnum;
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use thiserror::Error;

/// Length of the IPv4 header emitted by this crate (no options).
pub const IPV4_HEADER_LEN: usize = 20;
/// Minimum (and emitted) TCP header length.
pub const TCP_HEADER_LEN: usize = 20;
/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;

/// Bytes taken by the fixed TCP fields, before any option.
const TCP_FIXED_LEN: usize = 20;
/// Room left for options inside the padded 20-byte TCP header.
pub const TCP_OPTIONS_BUDGET: usize = TCP_HEADER_LEN - TCP_FIXED_LEN;

const IPV4_TTL: u8 = 255;
/// Don't Fragment, already shifted into the flags/fragment-offset word.
const IPV4_FLAG_DONT_FRAGMENT: u16 = 0x4000;

/// Errors that can occur while encoding headers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The IP protocol number is neither TCP nor UDP.
    #[error("Protocol {0} not supported")]
    UnsupportedProtocol(u8),
    /// TCP options do not fit into the padded header.
    #[error("TCP options of {len} bytes exceed the {budget}-byte header budget")]
    TcpOptionsOverflow { len: usize, budget: usize },
}

/// Transport protocols the codec knows how to build.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, ValueEnum)]
pub enum Protocol {
    /// Transmission Control Protocol.
    #[default]
    Tcp,
    /// User Datagram Protocol.
    Udp,
}

impl Protocol {
    /// Returns the IP next-level protocol number.
    pub fn ip_protocol(self) -> IpNextHeaderProtocol {
        match self {
            Protocol::Tcp => IpNextHeaderProtocols::Tcp,
            Protocol::Udp => IpNextHeaderProtocols::Udp,
        }
    }

    /// Length of the transport header this crate emits for the protocol.
    pub fn header_len(self) -> usize {
        match self {
            Protocol::Tcp => TCP_HEADER_LEN,
            Protocol::Udp => UDP_HEADER_LEN,
        }
    }
}

impl TryFrom<IpNextHeaderProtocol> for Protocol {
    type Error = CodecError;

    fn try_from(proto: IpNextHeaderProtocol) -> Result<Self, Self::Error> {
        match proto {
            IpNextHeaderProtocols::Tcp => Ok(Protocol::Tcp),
            IpNextHeaderProtocols::Udp => Ok(Protocol::Udp),
            other => Err(CodecError::UnsupportedProtocol(other.0)),
        }
    }
}

impl From<Protocol> for IpNextHeaderProtocol {
    fn from(proto: Protocol) -> Self {
        proto.ip_protocol()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Sums `data` as big-endian 16-bit words with end-around carry.
///
/// An odd trailing byte is added as-is, without being shifted into the high
/// half of a word. Any input length is accepted.
pub fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u64 = 0;
    let mut words = data.chunks_exact(2);
    for word in words.by_ref() {
        sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u64::from(*last);
    }

    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    sum as u16
}

/// Computes the internet checksum of `data`.
///
/// ```
/// use queue_latency::headers::checksum;
/// assert_eq!(checksum(&[0x00, 0x01, 0xf2, 0x03]), !0xf204);
/// ```
pub fn checksum(data: &[u8]) -> u16 {
    !ones_complement_sum(data)
}

/// Encodes a 20-byte IPv4 header with a valid checksum.
///
/// # Errors
/// Returns [`CodecError::UnsupportedProtocol`] unless `proto` is TCP or UDP.
pub fn encode_ipv4_header(
    proto: IpNextHeaderProtocol,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    total_length: u16,
) -> Result<[u8; IPV4_HEADER_LEN], CodecError> {
    let proto = Protocol::try_from(proto)?;

    let mut buf = [0u8; IPV4_HEADER_LEN];
    buf[0] = (4 << 4) | (IPV4_HEADER_LEN / 4) as u8;
    buf[1] = 0; // TOS
    buf[2..4].copy_from_slice(&total_length.to_be_bytes());
    buf[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    buf[6..8].copy_from_slice(&IPV4_FLAG_DONT_FRAGMENT.to_be_bytes());
    buf[8] = IPV4_TTL;
    buf[9] = proto.ip_protocol().0;
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());

    let ck = checksum(&buf);
    buf[10..12].copy_from_slice(&ck.to_be_bytes());
    Ok(buf)
}

/// A single TCP option as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOption {
    /// Option kind.
    pub kind: u8,
    /// Option data, without the kind and length octets.
    pub data: Vec<u8>,
}

impl TcpOption {
    /// Encoded length: single-octet kinds (EOL, NOP) carry no length or data.
    fn wire_len(&self) -> usize {
        match self.kind {
            0 | 1 => 1,
            _ => 2 + self.data.len(),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.kind);
        if self.wire_len() > 1 {
            out.push(self.wire_len() as u8);
            out.extend_from_slice(&self.data);
        }
    }
}

/// Logical TCP header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Control bits (FIN, SYN, RST, PSH, ACK, URG, ECE, CWR).
    pub flags: u8,
    pub window: u16,
    pub urgent: u16,
    pub options: Vec<TcpOption>,
}

impl TcpHeader {
    /// Header used for injected acks.
    pub fn ack(src_port: u16, dst_port: u16) -> Self {
        TcpHeader {
            src_port,
            dst_port,
            seq: 0,
            ack: 1,
            flags: 0,
            window: 65535,
            urgent: 1,
            options: Vec::new(),
        }
    }
}

/// Encodes a TCP header, zero-padded to 20 bytes. The checksum is left zero.
///
/// # Errors
/// Returns [`CodecError::TcpOptionsOverflow`] if the options do not fit into
/// [`TCP_OPTIONS_BUDGET`]. Options are never truncated.
pub fn encode_tcp_header(header: &TcpHeader) -> Result<[u8; TCP_HEADER_LEN], CodecError> {
    let options_len: usize = header.options.iter().map(TcpOption::wire_len).sum();
    if options_len > TCP_OPTIONS_BUDGET {
        return Err(CodecError::TcpOptionsOverflow {
            len: options_len,
            budget: TCP_OPTIONS_BUDGET,
        });
    }

    let mut out = Vec::with_capacity(TCP_HEADER_LEN);
    out.extend_from_slice(&header.src_port.to_be_bytes());
    out.extend_from_slice(&header.dst_port.to_be_bytes());
    out.extend_from_slice(&header.seq.to_be_bytes());
    out.extend_from_slice(&header.ack.to_be_bytes());
    out.push(((TCP_HEADER_LEN / 4) as u8) << 4);
    out.push(header.flags);
    out.extend_from_slice(&header.window.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum
    out.extend_from_slice(&header.urgent.to_be_bytes());
    for option in &header.options {
        option.write_to(&mut out);
    }

    let mut buf = [0u8; TCP_HEADER_LEN];
    buf[..out.len()].copy_from_slice(&out);
    Ok(buf)
}

/// Encodes an 8-byte UDP header for a payload of `payload_len` bytes.
///
/// The checksum is left zero.
pub fn encode_udp_header(src_port: u16, dst_port: u16, payload_len: u16) -> [u8; UDP_HEADER_LEN] {
    let mut buf = [0u8; UDP_HEADER_LEN];
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..6].copy_from_slice(&(UDP_HEADER_LEN as u16 + payload_len).to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::{
        ipv4::{Ipv4Flags, Ipv4Packet},
        tcp::TcpPacket,
        udp::UdpPacket,
    };

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 58, 4);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 58, 5);

    fn verifies(data: &[u8]) -> bool {
        ones_complement_sum(data) == 0xffff
    }

    #[test]
    fn test_checksum_identity_ipv4() {
        let header =
            encode_ipv4_header(IpNextHeaderProtocols::Tcp, SRC, DST, (20 + 20 + 24) as u16)
                .unwrap();
        assert!(verifies(&header));
    }

    #[test]
    fn test_checksum_identity_even_lengths() {
        for len in [2usize, 4, 10, 20, 64] {
            let mut data: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            data[0] = 0;
            data[1] = 0;
            let ck = checksum(&data);
            data[0..2].copy_from_slice(&ck.to_be_bytes());
            assert!(verifies(&data), "length {} did not verify", len);
        }
    }

    #[test]
    fn test_checksum_identity_odd_lengths() {
        // The trailing byte is summed unshifted, so the checksum word must sit
        // in a position that keeps the same alignment when summed again.
        for len in [3usize, 5, 21, 63] {
            let mut data: Vec<u8> = (0..len).map(|i| (i * 91 + 7) as u8).collect();
            data[0] = 0;
            data[1] = 0;
            let ck = checksum(&data);
            data[0..2].copy_from_slice(&ck.to_be_bytes());
            assert!(verifies(&data), "length {} did not verify", len);
        }
    }

    #[test]
    fn test_checksum_known_vector() {
        // RFC 1071 example words 0x0001 0xf203 0xf4f5 0xf6f7
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(ones_complement_sum(&data), 0xddf2);
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn test_checksum_large_input() {
        // Far beyond what a 32-bit accumulator holds.
        let data = vec![0xffu8; 512 * 1024];
        assert_eq!(ones_complement_sum(&data), 0xffff);
        assert_eq!(checksum(&data), 0);

        let mut odd = vec![0x12u8; 300_001];
        odd[0] = 0x80;
        let sum = ones_complement_sum(&odd);
        let mut with_checksum = (!sum).to_be_bytes().to_vec();
        with_checksum.extend_from_slice(&odd);
        assert_eq!(ones_complement_sum(&with_checksum), 0xffff);
    }

    #[test]
    fn test_checksum_empty() {
        assert_eq!(checksum(&[]), 0xffff);
    }

    #[test]
    fn test_ipv4_header_fields() {
        let header = encode_ipv4_header(IpNextHeaderProtocols::Udp, SRC, DST, 52).unwrap();
        assert_eq!(header.len(), IPV4_HEADER_LEN);

        let ip = Ipv4Packet::new(&header).unwrap();
        assert_eq!(ip.get_version(), 4);
        assert_eq!(ip.get_header_length(), 5);
        assert_eq!(ip.get_total_length(), 52);
        assert_eq!(ip.get_ttl(), 255);
        assert_eq!(ip.get_flags(), Ipv4Flags::DontFragment);
        assert_eq!(ip.get_fragment_offset(), 0);
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Udp);
        assert_eq!(ip.get_source(), SRC);
        assert_eq!(ip.get_destination(), DST);
        assert_eq!(ip.get_checksum(), pnet::packet::ipv4::checksum(&ip));
    }

    #[test]
    fn test_ipv4_header_rejects_other_protocols() {
        for proto in [
            IpNextHeaderProtocols::Icmp,
            IpNextHeaderProtocols::Ipv6,
            IpNextHeaderProtocol(0),
            IpNextHeaderProtocol(255),
        ] {
            assert_eq!(
                encode_ipv4_header(proto, SRC, DST, 40),
                Err(CodecError::UnsupportedProtocol(proto.0))
            );
        }
    }

    #[test]
    fn test_ipv4_header_is_deterministic() {
        let a = encode_ipv4_header(IpNextHeaderProtocols::Tcp, SRC, DST, 64).unwrap();
        let b = encode_ipv4_header(IpNextHeaderProtocols::Tcp, SRC, DST, 64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_tcp_header_layout() {
        let header = encode_tcp_header(&TcpHeader::ack(6000, 5000)).unwrap();
        assert_eq!(header.len(), TCP_HEADER_LEN);

        let tcp = TcpPacket::new(&header).unwrap();
        assert_eq!(tcp.get_source(), 6000);
        assert_eq!(tcp.get_destination(), 5000);
        assert_eq!(tcp.get_sequence(), 0);
        assert_eq!(tcp.get_acknowledgement(), 1);
        assert_eq!(tcp.get_data_offset(), 5);
        assert_eq!(tcp.get_window(), 65535);
        assert_eq!(tcp.get_checksum(), 0);
        assert_eq!(tcp.get_urgent_ptr(), 1);
    }

    #[test]
    fn test_tcp_header_options_within_budget() {
        let header = TcpHeader::ack(1, 2);
        assert_eq!(encode_tcp_header(&header).unwrap().len(), TCP_HEADER_LEN);
    }

    #[test]
    fn test_tcp_header_options_over_budget() {
        let mut header = TcpHeader::ack(1, 2);
        header.options.push(TcpOption {
            kind: 1,
            data: Vec::new(),
        });
        assert_eq!(
            encode_tcp_header(&header),
            Err(CodecError::TcpOptionsOverflow {
                len: 1,
                budget: TCP_OPTIONS_BUDGET
            })
        );

        header.options = vec![TcpOption {
            kind: 2,
            data: vec![0x05, 0xb4],
        }];
        assert_eq!(
            encode_tcp_header(&header),
            Err(CodecError::TcpOptionsOverflow {
                len: 4,
                budget: TCP_OPTIONS_BUDGET
            })
        );
    }

    #[test]
    fn test_udp_header_layout() {
        let header = encode_udp_header(6000, 5000, 24);
        assert_eq!(header.len(), UDP_HEADER_LEN);

        let udp = UdpPacket::new(&header).unwrap();
        assert_eq!(udp.get_source(), 6000);
        assert_eq!(udp.get_destination(), 5000);
        assert_eq!(udp.get_length(), 32);
        assert_eq!(udp.get_checksum(), 0);
    }

    #[test]
    fn test_protocol_conversion() {
        assert_eq!(
            Protocol::try_from(IpNextHeaderProtocols::Tcp),
            Ok(Protocol::Tcp)
        );
        assert_eq!(
            Protocol::try_from(IpNextHeaderProtocols::Udp),
            Ok(Protocol::Udp)
        );
        assert_eq!(
            Protocol::try_from(IpNextHeaderProtocols::Icmp),
            Err(CodecError::UnsupportedProtocol(1))
        );
        assert_eq!(
            IpNextHeaderProtocol::from(Protocol::Udp),
            IpNextHeaderProtocols::Udp
        );
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
    }
}
