//! TCP header view

use std::net::IpAddr;

use super::ipv4::{read_u16, write_u16};
use super::{checksum, ip_proto};
use crate::error::PacketError;

/// Minimum TCP header length (no options)
pub const HEADER_LEN: usize = 20;

/// TCP flag bits
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

mod field {
    pub const SRC_PORT: usize = 0;
    pub const DST_PORT: usize = 2;
    pub const SEQ: usize = 4;
    pub const ACK: usize = 8;
    pub const DATA_OFFSET: usize = 12;
    pub const FLAGS: usize = 13;
    pub const WINDOW: usize = 14;
    pub const CHECKSUM: usize = 16;
}

/// A borrowed view over a TCP segment
#[derive(Debug)]
pub struct TcpPacket<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> TcpPacket<T> {
    pub const fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Wrap a segment after validating the data offset
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the segment is shorter than its header.
    pub fn new_checked(buffer: T) -> Result<Self, PacketError> {
        let packet = Self::new_unchecked(buffer);
        let len = packet.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(PacketError::Truncated { layer: "TCP", len });
        }
        let header_len = packet.header_len();
        if header_len < HEADER_LEN || header_len > len {
            return Err(PacketError::Malformed {
                layer: "TCP",
                reason: "data offset out of range",
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

    pub fn seq_number(&self) -> u32 {
        read_u32(self.buffer.as_ref(), field::SEQ)
    }

    pub fn ack_number(&self) -> u32 {
        read_u32(self.buffer.as_ref(), field::ACK)
    }

    pub fn header_len(&self) -> usize {
        usize::from(self.buffer.as_ref()[field::DATA_OFFSET] >> 4) * 4
    }

    pub fn flags(&self) -> u8 {
        self.buffer.as_ref()[field::FLAGS]
    }

    pub fn syn(&self) -> bool {
        self.flags() & flags::SYN != 0
    }

    pub fn ack(&self) -> bool {
        self.flags() & flags::ACK != 0
    }

    pub fn fin(&self) -> bool {
        self.flags() & flags::FIN != 0
    }

    pub fn rst(&self) -> bool {
        self.flags() & flags::RST != 0
    }

    /// The first segment of a handshake: SYN without ACK
    pub fn is_connection_request(&self) -> bool {
        self.syn() && !self.ack()
    }

    pub fn window(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::WINDOW)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.buffer.as_ref(), field::CHECKSUM)
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[self.header_len()..]
    }

    /// Verify the checksum against the given pseudo-header addresses
    pub fn verify_checksum(&self, src: &IpAddr, dst: &IpAddr) -> bool {
        checksum::verify_transport(src, dst, ip_proto::TCP, self.buffer.as_ref())
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TcpPacket<T> {
    pub fn set_src_port(&mut self, port: u16) {
        write_u16(self.buffer.as_mut(), field::SRC_PORT, port);
    }

    pub fn set_dst_port(&mut self, port: u16) {
        write_u16(self.buffer.as_mut(), field::DST_PORT, port);
    }

    /// Recompute the checksum for the given pseudo-header addresses
    pub fn fill_checksum(&mut self, src: &IpAddr, dst: &IpAddr) {
        write_u16(self.buffer.as_mut(), field::CHECKSUM, 0);
        let csum = checksum::transport(src, dst, ip_proto::TCP, self.buffer.as_ref());
        write_u16(self.buffer.as_mut(), field::CHECKSUM, csum);
    }
}

/// Write an option-less TCP header into `buf[..20]`; the checksum is left zero
pub(crate) fn emit_header(
    buf: &mut [u8],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flag_bits: u8,
    window: u16,
) {
    buf[..HEADER_LEN].fill(0);
    write_u16(buf, field::SRC_PORT, src_port);
    write_u16(buf, field::DST_PORT, dst_port);
    buf[field::SEQ..field::SEQ + 4].copy_from_slice(&seq.to_be_bytes());
    buf[field::ACK..field::ACK + 4].copy_from_slice(&ack.to_be_bytes());
    buf[field::DATA_OFFSET] = 5 << 4;
    buf[field::FLAGS] = flag_bits;
    write_u16(buf, field::WINDOW, window);
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
