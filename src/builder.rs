//! Raw packet assembly: IPv4 header, transport header, telemetry payload.

use std::net::{Ipv4Addr, SocketAddrV4};

use pnet::packet::ip::IpNextHeaderProtocol;

use crate::{
    headers::{
        encode_ipv4_header, encode_tcp_header, encode_udp_header, CodecError, Protocol, TcpHeader,
        IPV4_HEADER_LEN,
    },
    telemetry::{TelemetryPayload, TELEMETRY_LEN},
};

/// Transport-level description of a packet to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescriptor {
    /// IP protocol number; only TCP and UDP can be built.
    pub protocol: IpNextHeaderProtocol,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: TelemetryPayload,
}

impl TransportDescriptor {
    /// Creates a descriptor addressed `src` -> `dst`.
    pub fn new(
        protocol: impl Into<IpNextHeaderProtocol>,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        payload: TelemetryPayload,
    ) -> Self {
        TransportDescriptor {
            protocol: protocol.into(),
            src: *src.ip(),
            dst: *dst.ip(),
            src_port: src.port(),
            dst_port: dst.port(),
            payload,
        }
    }

    /// Length of the encoded payload.
    pub fn payload_len(&self) -> usize {
        TELEMETRY_LEN
    }

    /// Destination socket address.
    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst, self.dst_port)
    }
}

/// Network-level description: wraps exactly one transport descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDescriptor {
    pub transport: TransportDescriptor,
}

impl From<TransportDescriptor> for NetworkDescriptor {
    fn from(transport: TransportDescriptor) -> Self {
        NetworkDescriptor { transport }
    }
}

/// Builds the complete packet described by `nd`.
///
/// # Errors
/// Returns [`CodecError::UnsupportedProtocol`] for anything but TCP or UDP,
/// and propagates header encoding errors unchanged.
pub fn build(nd: &NetworkDescriptor) -> Result<Vec<u8>, CodecError> {
    let td = &nd.transport;
    let protocol = Protocol::try_from(td.protocol)?;

    let payload = td.payload.to_bytes();
    let payload_len = td.payload_len();

    let mut transport = Vec::with_capacity(protocol.header_len());
    match protocol {
        Protocol::Tcp => {
            transport.extend_from_slice(&encode_tcp_header(&TcpHeader::ack(
                td.src_port,
                td.dst_port,
            ))?);
        }
        Protocol::Udp => {
            transport.extend_from_slice(&encode_udp_header(
                td.src_port,
                td.dst_port,
                payload_len as u16,
            ));
        }
    }

    let total_length = IPV4_HEADER_LEN + transport.len() + payload_len;
    let ip = encode_ipv4_header(td.protocol, td.src, td.dst, total_length as u16)?;

    let mut packet = Vec::with_capacity(total_length);
    packet.extend_from_slice(&ip);
    packet.extend_from_slice(&transport);
    packet.extend_from_slice(&payload);
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::ones_complement_sum;
    use pnet::packet::{
        ip::IpNextHeaderProtocols, ipv4::Ipv4Packet, tcp::TcpPacket, udp::UdpPacket, Packet,
    };

    fn descriptor(protocol: IpNextHeaderProtocol) -> NetworkDescriptor {
        TransportDescriptor::new(
            protocol,
            "10.0.0.2:6000".parse().unwrap(),
            "10.0.0.1:5000".parse().unwrap(),
            TelemetryPayload::probe(1, 7, 1_700_000_000),
        )
        .into()
    }

    #[test]
    fn test_build_tcp() {
        let nd = descriptor(IpNextHeaderProtocols::Tcp);
        let packet = build(&nd).unwrap();
        assert_eq!(packet.len(), 20 + 20 + TELEMETRY_LEN);

        let ip = Ipv4Packet::new(&packet).unwrap();
        assert_eq!(ip.get_total_length() as usize, packet.len());
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Tcp);
        assert_eq!(ip.get_source(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ip.get_destination(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ones_complement_sum(&packet[..IPV4_HEADER_LEN]), 0xffff);

        let tcp = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(tcp.get_source(), 6000);
        assert_eq!(tcp.get_destination(), 5000);
        let payload = TelemetryPayload::from_bytes(tcp.payload()).unwrap();
        assert_eq!(payload, nd.transport.payload);
    }

    #[test]
    fn test_build_udp() {
        let nd = descriptor(IpNextHeaderProtocols::Udp);
        let packet = build(&nd).unwrap();
        assert_eq!(packet.len(), 20 + 8 + TELEMETRY_LEN);

        let ip = Ipv4Packet::new(&packet).unwrap();
        assert_eq!(ip.get_total_length() as usize, packet.len());
        let udp = UdpPacket::new(ip.payload()).unwrap();
        assert_eq!(udp.get_length() as usize, 8 + TELEMETRY_LEN);
        let payload = TelemetryPayload::from_bytes(udp.payload()).unwrap();
        assert_eq!(payload, nd.transport.payload);
    }

    #[test]
    fn test_build_rejects_other_protocols() {
        for raw in [0u8, 1, 2, 41, 58, 132, 255] {
            let nd = descriptor(IpNextHeaderProtocol(raw));
            assert_eq!(build(&nd), Err(CodecError::UnsupportedProtocol(raw)));
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let nd = descriptor(IpNextHeaderProtocols::Udp);
        assert_eq!(build(&nd).unwrap(), build(&nd).unwrap());
    }

    #[test]
    fn test_descriptor_accessors() {
        let nd = descriptor(Protocol::Tcp.ip_protocol());
        assert_eq!(nd.transport.payload_len(), TELEMETRY_LEN);
        assert_eq!(
            nd.transport.destination(),
            "10.0.0.1:5000".parse::<SocketAddrV4>().unwrap()
        );
    }
}
