//! Connection four-tuple

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Original source and destination of a redirected flow
///
/// Addresses are stored as 16 bytes with IPv4 in its IPv4-mapped IPv6 form,
/// so one key type covers both families and converts back losslessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple {
    source_addr: [u8; 16],
    destination_addr: [u8; 16],
    source_port: u16,
    destination_port: u16,
}

impl Tuple {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source_addr: widen(source.ip()),
            destination_addr: widen(destination.ip()),
            source_port: source.port(),
            destination_port: destination.port(),
        }
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(narrow(self.source_addr), self.source_port)
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(narrow(self.destination_addr), self.destination_port)
    }

    pub const fn source_port(&self) -> u16 {
        self.source_port
    }

    pub const fn destination_port(&self) -> u16 {
        self.destination_port
    }

    pub fn is_ipv4(&self) -> bool {
        self.source().is_ipv4()
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source(), self.destination())
    }
}

fn widen(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn narrow(octets: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(octets);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}
