//! IPv6 header view
//!
//! Only the fixed header is understood. The next-header field is taken as
//! the transport protocol; packets carrying extension headers therefore
//! fall through to the "unsupported protocol" drop.

use std::net::Ipv6Addr;

use super::ipv4::{read_u16, write_u16};
use crate::error::PacketError;

/// Fixed IPv6 header length
pub const HEADER_LEN: usize = 40;

mod field {
    pub const PAYLOAD_LEN: usize = 4;
    pub const NEXT_HEADER: usize = 6;
    pub const HOP_LIMIT: usize = 7;
    pub const SRC: usize = 8;
    pub const DST: usize = 24;
}

/// A borrowed view over an IPv6 packet
#[derive(Debug)]
pub struct Ipv6Packet<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Ipv6Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wrap a buffer after validating the fixed header and payload length
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the buffer is truncated or not IPv6.
    pub fn new_checked(buffer: T) -> Result<Self, PacketError> {
        let packet = Self::new_unchecked(buffer);
        let len = packet.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(PacketError::Truncated { layer: "IPv6", len });
        }
        if packet.version() != 6 {
            return Err(PacketError::UnsupportedVersion(packet.version()));
        }
        if HEADER_LEN + usize::from(packet.payload_len()) > len {
            return Err(PacketError::Truncated { layer: "IPv6", len });
        }
        Ok(packet)
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[0] >> 4
    }

    pub fn payload_len(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::PAYLOAD_LEN)
    }

    pub fn next_header(&self) -> u8 {
        self.buffer.as_ref()[field::NEXT_HEADER]
    }

    pub fn hop_limit(&self) -> u8 {
        self.buffer.as_ref()[field::HOP_LIMIT]
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(read_octets(self.buffer.as_ref(), field::SRC))
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(read_octets(self.buffer.as_ref(), field::DST))
    }

    pub fn header(&self) -> &[u8] {
        &self.buffer.as_ref()[..HEADER_LEN]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[HEADER_LEN..self.total_len()]
    }

    pub fn packet(&self) -> &[u8] {
        &self.buffer.as_ref()[..self.total_len()]
    }

    /// Fixed header plus payload length
    pub fn total_len(&self) -> usize {
        HEADER_LEN + usize::from(self.payload_len())
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv6Packet<T> {
    pub fn set_payload_len(&mut self, len: u16) {
        write_u16(self.buffer.as_mut(), field::PAYLOAD_LEN, len);
    }

    pub fn set_hop_limit(&mut self, hops: u8) {
        self.buffer.as_mut()[field::HOP_LIMIT] = hops;
    }

    pub fn set_src_addr(&mut self, addr: Ipv6Addr) {
        self.buffer.as_mut()[field::SRC..field::SRC + 16].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Ipv6Addr) {
        self.buffer.as_mut()[field::DST..field::DST + 16].copy_from_slice(&addr.octets());
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = self.total_len();
        &mut self.buffer.as_mut()[HEADER_LEN..end]
    }
}

/// Write a fresh IPv6 header into `buf[..40]`
pub(crate) fn emit_header(
    buf: &mut [u8],
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: u8,
    payload_len: u16,
    hop_limit: u8,
) {
    buf[..HEADER_LEN].fill(0);
    buf[0] = 0x60;
    write_u16(buf, field::PAYLOAD_LEN, payload_len);
    buf[field::NEXT_HEADER] = next_header;
    buf[field::HOP_LIMIT] = hop_limit;
    buf[field::SRC..field::SRC + 16].copy_from_slice(&src.octets());
    buf[field::DST..field::DST + 16].copy_from_slice(&dst.octets());
}

fn read_octets(buf: &[u8], at: usize) -> [u8; 16] {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[at..at + 16]);
    octets
}
