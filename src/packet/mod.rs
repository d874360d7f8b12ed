//! Zero-copy packet views
//!
//! Each view wraps a borrowed buffer (`&[u8]` for reading, `&mut [u8]` for
//! in-place rewriting) and cannot outlive it. Parsing validates lengths
//! once in `new_checked`; accessors on a checked view never read outside
//! the buffer.
//!
//! # Example
//!
//! ```
//! use tun_nat::packet::{build, IpPacket};
//!
//! let mut buf = build::udp_datagram(
//!     "10.0.0.2:5353".parse().unwrap(),
//!     "1.1.1.1:53".parse().unwrap(),
//!     b"query",
//! )
//! .unwrap();
//!
//! let mut ip = IpPacket::new_checked(&mut buf[..]).unwrap();
//! ip.rewrite_endpoints("172.19.0.2:4000".parse().unwrap(), "172.19.0.1:53".parse().unwrap())
//!     .unwrap();
//! assert!(build::checksums_valid(ip.packet()));
//! ```

pub mod build;
pub mod checksum;
pub mod icmp;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

use std::net::{IpAddr, SocketAddr};

pub use icmp::IcmpPacket;
pub use ipv4::Ipv4Packet;
pub use ipv6::Ipv6Packet;
pub use tcp::TcpPacket;
pub use udp::UdpPacket;

use crate::error::PacketError;

/// IP protocol numbers handled by the engine
pub mod ip_proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;
}

/// An IPv4 or IPv6 packet, chosen by the version nibble
#[derive(Debug)]
pub enum IpPacket<T> {
    V4(Ipv4Packet<T>),
    V6(Ipv6Packet<T>),
}

impl<T: AsRef<[u8]>> IpPacket<T> {
    /// Parse a packet read from the device
    ///
    /// # Errors
    ///
    /// Returns `PacketError` for empty buffers, unknown versions and
    /// inconsistent length fields.
    pub fn new_checked(buffer: T) -> Result<Self, PacketError> {
        let version = match buffer.as_ref().first() {
            Some(byte) => byte >> 4,
            None => return Err(PacketError::Truncated { layer: "IP", len: 0 }),
        };
        match version {
            4 => Ok(Self::V4(Ipv4Packet::new_checked(buffer)?)),
            6 => Ok(Self::V6(Ipv6Packet::new_checked(buffer)?)),
            other => Err(PacketError::UnsupportedVersion(other)),
        }
    }

    pub const fn is_ipv4(&self) -> bool {
        matches!(self, Self::V4(_))
    }

    /// Transport protocol (next header for IPv6)
    pub fn protocol(&self) -> u8 {
        match self {
            Self::V4(p) => p.protocol(),
            Self::V6(p) => p.next_header(),
        }
    }

    pub fn src_addr(&self) -> IpAddr {
        match self {
            Self::V4(p) => IpAddr::V4(p.src_addr()),
            Self::V6(p) => IpAddr::V6(p.src_addr()),
        }
    }

    pub fn dst_addr(&self) -> IpAddr {
        match self {
            Self::V4(p) => IpAddr::V4(p.dst_addr()),
            Self::V6(p) => IpAddr::V6(p.dst_addr()),
        }
    }

    /// IPv4 fragments. IPv6 fragments carry a fragment extension header and
    /// are rejected as an unsupported protocol instead.
    pub fn is_fragment(&self) -> bool {
        match self {
            Self::V4(p) => p.is_fragment(),
            Self::V6(_) => false,
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            Self::V4(p) => p.header_len(),
            Self::V6(_) => ipv6::HEADER_LEN,
        }
    }

    /// Header bytes
    pub fn header(&self) -> &[u8] {
        match self {
            Self::V4(p) => p.header(),
            Self::V6(p) => p.header(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::V4(p) => p.payload(),
            Self::V6(p) => p.payload(),
        }
    }

    /// The packet up to its declared length
    pub fn packet(&self) -> &[u8] {
        match self {
            Self::V4(p) => p.packet(),
            Self::V6(p) => p.packet(),
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> IpPacket<T> {
    /// # Errors
    ///
    /// Returns `PacketError::FamilyMismatch` if `addr` is of the other family.
    pub fn set_src_addr(&mut self, addr: IpAddr) -> Result<(), PacketError> {
        match (self, addr) {
            (Self::V4(p), IpAddr::V4(a)) => p.set_src_addr(a),
            (Self::V6(p), IpAddr::V6(a)) => p.set_src_addr(a),
            (_, other) => return Err(PacketError::FamilyMismatch(other)),
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `PacketError::FamilyMismatch` if `addr` is of the other family.
    pub fn set_dst_addr(&mut self, addr: IpAddr) -> Result<(), PacketError> {
        match (self, addr) {
            (Self::V4(p), IpAddr::V4(a)) => p.set_dst_addr(a),
            (Self::V6(p), IpAddr::V6(a)) => p.set_dst_addr(a),
            (_, other) => return Err(PacketError::FamilyMismatch(other)),
        }
        Ok(())
    }

    /// Swap source and destination addresses
    pub fn swap_addrs(&mut self) {
        match self {
            Self::V4(p) => {
                let (src, dst) = (p.src_addr(), p.dst_addr());
                p.set_src_addr(dst);
                p.set_dst_addr(src);
            }
            Self::V6(p) => {
                let (src, dst) = (p.src_addr(), p.dst_addr());
                p.set_src_addr(dst);
                p.set_dst_addr(src);
            }
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        match self {
            Self::V4(p) => p.payload_mut(),
            Self::V6(p) => p.payload_mut(),
        }
    }

    /// Refresh the IPv4 header checksum (IPv6 has none)
    pub fn fill_checksum(&mut self) {
        if let Self::V4(p) = self {
            p.fill_checksum();
        }
    }

    /// Rewrite both endpoints of a TCP or UDP packet and refresh every
    /// checksum it carries.
    ///
    /// Validates the transport header before touching anything, so a failed
    /// call leaves the buffer as it was.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the transport header is malformed, the
    /// protocol has no ports, or an address is of the wrong family.
    pub fn rewrite_endpoints(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Result<(), PacketError> {
        let expect_v4 = self.is_ipv4();
        for ip in [src.ip(), dst.ip()] {
            if ip.is_ipv4() != expect_v4 {
                return Err(PacketError::FamilyMismatch(ip));
            }
        }
        let protocol = self.protocol();
        match protocol {
            ip_proto::TCP => {
                TcpPacket::new_checked(self.payload())?;
            }
            ip_proto::UDP => {
                UdpPacket::new_checked(self.payload())?;
            }
            _ => {
                return Err(PacketError::Malformed {
                    layer: "IP",
                    reason: "protocol carries no ports",
                })
            }
        }

        self.set_src_addr(src.ip())?;
        self.set_dst_addr(dst.ip())?;
        let (src_ip, dst_ip) = (src.ip(), dst.ip());
        if protocol == ip_proto::TCP {
            let mut tcp = TcpPacket::new_unchecked(self.payload_mut());
            tcp.set_src_port(src.port());
            tcp.set_dst_port(dst.port());
            tcp.fill_checksum(&src_ip, &dst_ip);
        } else {
            let mut udp = UdpPacket::new_unchecked(self.payload_mut());
            udp.set_src_port(src.port());
            udp.set_dst_port(dst.port());
            udp.fill_checksum(&src_ip, &dst_ip);
        }
        self.fill_checksum();
        Ok(())
    }
}
