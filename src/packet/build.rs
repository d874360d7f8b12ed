//! Builders for synthesized packets
//!
//! Used by the pull-mode UDP socket to write replies that have no request
//! template, and by tests to produce device input.

use std::net::{IpAddr, SocketAddr};

use bytes::BytesMut;

use super::tcp::TcpPacket;
use super::udp::UdpPacket;
use super::{icmp, ip_proto, ipv4, ipv6, tcp, udp, IpPacket};
use crate::error::PacketError;

/// TTL / hop limit of synthesized packets
pub const DEFAULT_TTL: u8 = 64;

/// Allocate a zeroed packet of the right size and write its IP header
fn ip_frame(
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    transport_len: usize,
) -> Result<(BytesMut, usize), PacketError> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let total = ipv4::HEADER_LEN + transport_len;
            let total_len = u16::try_from(total).map_err(|_| PacketError::TooLarge(total))?;
            let mut buf = BytesMut::zeroed(total);
            ipv4::emit_header(&mut buf, src, dst, protocol, total_len, DEFAULT_TTL);
            Ok((buf, ipv4::HEADER_LEN))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let payload_len =
                u16::try_from(transport_len).map_err(|_| PacketError::TooLarge(transport_len))?;
            let mut buf = BytesMut::zeroed(ipv6::HEADER_LEN + transport_len);
            ipv6::emit_header(&mut buf, src, dst, protocol, payload_len, DEFAULT_TTL);
            Ok((buf, ipv6::HEADER_LEN))
        }
        (_, other) => Err(PacketError::FamilyMismatch(other)),
    }
}

/// Build a complete UDP/IP datagram with valid checksums
///
/// # Errors
///
/// Returns `PacketError` on mixed address families or an oversized payload.
pub fn udp_datagram(
    src: SocketAddr,
    dst: SocketAddr,
    payload: &[u8],
) -> Result<BytesMut, PacketError> {
    let udp_len = udp::HEADER_LEN + payload.len();
    let (mut buf, header_len) = ip_frame(src.ip(), dst.ip(), ip_proto::UDP, udp_len)?;
    let len = u16::try_from(udp_len).map_err(|_| PacketError::TooLarge(udp_len))?;

    let segment = &mut buf[header_len..];
    udp::emit_header(segment, src.port(), dst.port(), len);
    segment[udp::HEADER_LEN..].copy_from_slice(payload);
    UdpPacket::new_unchecked(segment).fill_checksum(&src.ip(), &dst.ip());
    Ok(buf)
}

/// Build a complete TCP/IP segment with valid checksums
///
/// # Errors
///
/// Returns `PacketError` on mixed address families or an oversized payload.
pub fn tcp_segment(
    src: SocketAddr,
    dst: SocketAddr,
    flags: u8,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Result<BytesMut, PacketError> {
    let tcp_len = tcp::HEADER_LEN + payload.len();
    let (mut buf, header_len) = ip_frame(src.ip(), dst.ip(), ip_proto::TCP, tcp_len)?;

    let segment = &mut buf[header_len..];
    tcp::emit_header(segment, src.port(), dst.port(), seq, ack, flags, u16::MAX);
    segment[tcp::HEADER_LEN..].copy_from_slice(payload);
    TcpPacket::new_unchecked(segment).fill_checksum(&src.ip(), &dst.ip());
    Ok(buf)
}

/// Build an ICMP (IPv4) or ICMPv6 echo request or reply
///
/// # Errors
///
/// Returns `PacketError` on mixed address families or oversized data.
pub fn icmp_echo(
    src: IpAddr,
    dst: IpAddr,
    request: bool,
    ident: u16,
    seq: u16,
    data: &[u8],
) -> Result<BytesMut, PacketError> {
    let (protocol, msg_type) = match (src.is_ipv4(), request) {
        (true, true) => (ip_proto::ICMP, icmp::ECHO_REQUEST_V4),
        (true, false) => (ip_proto::ICMP, icmp::ECHO_REPLY_V4),
        (false, true) => (ip_proto::ICMPV6, icmp::ECHO_REQUEST_V6),
        (false, false) => (ip_proto::ICMPV6, icmp::ECHO_REPLY_V6),
    };
    let (mut buf, header_len) = ip_frame(src, dst, protocol, icmp::HEADER_LEN + data.len())?;

    let message = &mut buf[header_len..];
    icmp::emit_echo(message, msg_type, ident, seq);
    message[icmp::HEADER_LEN..].copy_from_slice(data);
    let mut view = icmp::IcmpPacket::new_unchecked(message);
    if src.is_ipv4() {
        view.fill_checksum_v4();
    } else {
        view.fill_checksum_v6(&src, &dst);
    }
    Ok(buf)
}

/// Check every checksum a packet carries: IPv4 header and TCP/UDP/ICMP
///
/// Unknown protocols only have their IP header checked.
#[must_use]
pub fn checksums_valid(packet: &[u8]) -> bool {
    let Ok(ip) = IpPacket::new_checked(packet) else {
        return false;
    };
    if let IpPacket::V4(v4) = &ip {
        if !v4.verify_checksum() {
            return false;
        }
    }
    let (src, dst) = (ip.src_addr(), ip.dst_addr());
    match ip.protocol() {
        ip_proto::TCP => TcpPacket::new_checked(ip.payload())
            .is_ok_and(|tcp| tcp.verify_checksum(&src, &dst)),
        ip_proto::UDP => UdpPacket::new_checked(ip.payload())
            .is_ok_and(|udp| udp.verify_checksum(&src, &dst)),
        ip_proto::ICMP => {
            icmp::IcmpPacket::new_checked(ip.payload()).is_ok_and(|m| m.verify_checksum_v4())
        }
        ip_proto::ICMPV6 => icmp::IcmpPacket::new_checked(ip.payload())
            .is_ok_and(|m| m.verify_checksum_v6(&src, &dst)),
        _ => true,
    }
}
