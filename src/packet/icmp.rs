//! ICMP and ICMPv6 echo view
//!
//! Echo request and reply share their layout between the two versions:
//! type, code, checksum, identifier, sequence, data.

use std::net::IpAddr;

use super::ipv4::{read_u16, write_u16};
use super::{checksum, ip_proto};
use crate::error::PacketError;

/// Echo header length
pub const HEADER_LEN: usize = 8;

pub const ECHO_REQUEST_V4: u8 = 8;
pub const ECHO_REPLY_V4: u8 = 0;
pub const ECHO_REQUEST_V6: u8 = 128;
pub const ECHO_REPLY_V6: u8 = 129;

mod field {
    pub const TYPE: usize = 0;
    pub const CODE: usize = 1;
    pub const CHECKSUM: usize = 2;
    pub const IDENT: usize = 4;
    pub const SEQ: usize = 6;
}

/// A borrowed view over an ICMP or ICMPv6 message
#[derive(Debug)]
pub struct IcmpPacket<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> IcmpPacket<T> {
    pub const fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// # Errors
    ///
    /// Returns `PacketError::Truncated` below the 8-byte echo header.
    pub fn new_checked(buffer: T) -> Result<Self, PacketError> {
        let len = buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(PacketError::Truncated { layer: "ICMP", len });
        }
        Ok(Self::new_unchecked(buffer))
    }

    pub fn msg_type(&self) -> u8 {
        self.buffer.as_ref()[field::TYPE]
    }

    pub fn code(&self) -> u8 {
        self.buffer.as_ref()[field::CODE]
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::CHECKSUM)
    }

    pub fn ident(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::IDENT)
    }

    pub fn seq(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::SEQ)
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer.as_ref()[HEADER_LEN..]
    }

    /// ICMPv4 checksum covers the message only
    pub fn verify_checksum_v4(&self) -> bool {
        checksum::verify(0, self.buffer.as_ref())
    }

    /// ICMPv6 checksum includes the IPv6 pseudo-header
    pub fn verify_checksum_v6(&self, src: &IpAddr, dst: &IpAddr) -> bool {
        checksum::verify_transport(src, dst, ip_proto::ICMPV6, self.buffer.as_ref())
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> IcmpPacket<T> {
    pub fn set_msg_type(&mut self, msg_type: u8) {
        self.buffer.as_mut()[field::TYPE] = msg_type;
    }

    pub fn fill_checksum_v4(&mut self) {
        write_u16(self.buffer.as_mut(), field::CHECKSUM, 0);
        let csum = checksum::checksum(0, self.buffer.as_ref());
        write_u16(self.buffer.as_mut(), field::CHECKSUM, csum);
    }

    pub fn fill_checksum_v6(&mut self, src: &IpAddr, dst: &IpAddr) {
        write_u16(self.buffer.as_mut(), field::CHECKSUM, 0);
        let csum = checksum::transport(src, dst, ip_proto::ICMPV6, self.buffer.as_ref());
        write_u16(self.buffer.as_mut(), field::CHECKSUM, csum);
    }
}

/// Write an echo header into `buf[..8]`; the checksum is left zero
pub(crate) fn emit_echo(buf: &mut [u8], msg_type: u8, ident: u16, seq: u16) {
    buf[field::TYPE] = msg_type;
    buf[field::CODE] = 0;
    write_u16(buf, field::CHECKSUM, 0);
    write_u16(buf, field::IDENT, ident);
    write_u16(buf, field::SEQ, seq);
}
