//! UDP header view

use std::net::IpAddr;

use super::ipv4::{read_u16, write_u16};
use super::{checksum, ip_proto};
use crate::error::PacketError;

/// UDP header length
pub const HEADER_LEN: usize = 8;

mod field {
    pub const SRC_PORT: usize = 0;
    pub const DST_PORT: usize = 2;
    pub const LENGTH: usize = 4;
    pub const CHECKSUM: usize = 6;
}

/// A borrowed view over a UDP datagram
#[derive(Debug)]
pub struct UdpPacket<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> UdpPacket<T> {
    pub const fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wrap a datagram after validating the length field against the buffer
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the length field is below 8 or exceeds the
    /// IP payload.
    pub fn new_checked(buffer: T) -> Result<Self, PacketError> {
        let packet = Self::new_unchecked(buffer);
        let len = packet.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(PacketError::Truncated { layer: "UDP", len });
        }
        let length = usize::from(packet.len());
        if length < HEADER_LEN || length > len {
            return Err(PacketError::Malformed {
                layer: "UDP",
                reason: "length field disagrees with IP payload",
            });
        }
        Ok(packet)
    }

    pub fn src_port(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::SRC_PORT)
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::DST_PORT)
    }

    /// Length field: header plus payload
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::LENGTH)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::CHECKSUM)
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[HEADER_LEN..usize::from(self.len())]
    }

    /// Verify the checksum. A zero checksum over IPv4 means "not computed".
    pub fn verify_checksum(&self, src: &IpAddr, dst: &IpAddr) -> bool {
        if src.is_ipv4() && self.checksum() == 0 {
            return true;
        }
        let datagram = &self.buffer.as_ref()[..usize::from(self.len())];
        checksum::verify_transport(src, dst, ip_proto::UDP, datagram)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> UdpPacket<T> {
    pub fn set_src_port(&mut self, port: u16) {
        write_u16(self.buffer.as_mut(), field::SRC_PORT, port);
    }

    pub fn set_dst_port(&mut self, port: u16) {
        write_u16(self.buffer.as_mut(), field::DST_PORT, port);
    }

    pub fn set_len(&mut self, len: u16) {
        write_u16(self.buffer.as_mut(), field::LENGTH, len);
    }

    /// Recompute the checksum; a computed zero is sent as 0xffff
    pub fn fill_checksum(&mut self, src: &IpAddr, dst: &IpAddr) {
        let end = usize::from(self.len());
        write_u16(self.buffer.as_mut(), field::CHECKSUM, 0);
        let csum = match checksum::transport(src, dst, ip_proto::UDP, &self.buffer.as_ref()[..end])
        {
            0 => 0xffff,
            csum => csum,
        };
        write_u16(self.buffer.as_mut(), field::CHECKSUM, csum);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = usize::from(self.len());
        &mut self.buffer.as_mut()[HEADER_LEN..end]
    }
}

/// Write a UDP header into `buf[..8]`; the checksum is left zero
pub(crate) fn emit_header(buf: &mut [u8], src_port: u16, dst_port: u16, len: u16) {
    write_u16(buf, field::SRC_PORT, src_port);
    write_u16(buf, field::DST_PORT, dst_port);
    write_u16(buf, field::LENGTH, len);
    write_u16(buf, field::CHECKSUM, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn datagram(payload: &[u8]) -> Vec<u8> {
        let len = HEADER_LEN + payload.len();
        let mut buf = vec![0u8; len];
        emit_header(&mut buf, 5353, 53, u16::try_from(len).unwrap());
        buf[HEADER_LEN..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn test_parse_fields() {
        let buf = datagram(b"query");
        let udp = UdpPacket::new_checked(&buf[..]).unwrap();
        assert_eq!(udp.src_port(), 5353);
        assert_eq!(udp.dst_port(), 53);
        assert_eq!(udp.len(), 13);
        assert_eq!(udp.payload(), b"query");
    }

    #[test]
    fn test_length_field_validation() {
        let mut buf = datagram(b"query");
        write_u16(&mut buf, field::LENGTH, 14);
        assert!(matches!(
            UdpPacket::new_checked(&buf[..]),
            Err(PacketError::Malformed { .. })
        ));
        write_u16(&mut buf, field::LENGTH, 7);
        assert!(UdpPacket::new_checked(&buf[..]).is_err());
    }

    #[test]
    fn test_zero_checksum_ipv4_only() {
        let buf = datagram(b"x");
        let udp = UdpPacket::new_checked(&buf[..]).unwrap();
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(udp.verify_checksum(&v4, &v4));
        assert!(!udp.verify_checksum(&v6, &v6));
    }

    #[test]
    fn test_fill_checksum_v6() {
        let src: IpAddr = "fd00::2".parse().unwrap();
        let dst: IpAddr = "2001:db8::53".parse().unwrap();
        let mut buf = datagram(b"payload");
        let mut udp = UdpPacket::new_checked(&mut buf[..]).unwrap();
        udp.fill_checksum(&src, &dst);
        assert_ne!(udp.checksum(), 0);
        assert!(udp.verify_checksum(&src, &dst));
    }
}
