//! Internet checksum (RFC 1071)
//!
//! Sums are accumulated in a `u32` and folded at the end. A full 64 KiB
//! packet plus an IPv6 pseudo-header stays well below `u32::MAX`, so no
//! intermediate folding is needed.

use std::net::IpAddr;

/// Add `data` as big-endian 16-bit words to `acc`. An odd trailing byte is
/// padded with zero.
#[must_use]
pub fn sum(mut acc: u32, data: &[u8]) -> u32 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        acc = acc.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = words.remainder() {
        acc = acc.wrapping_add(u32::from(*last) << 8);
    }
    acc
}

/// Fold carries back into the low 16 bits
#[must_use]
pub const fn fold(mut acc: u32) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    acc as u16
}

/// One's complement checksum of `data` seeded with `initial`
#[must_use]
pub fn checksum(initial: u32, data: &[u8]) -> u16 {
    !fold(sum(initial, data))
}

/// A region that already carries its checksum verifies when it folds to 0xffff
#[must_use]
pub fn verify(initial: u32, data: &[u8]) -> bool {
    fold(sum(initial, data)) == 0xffff
}

/// Pseudo-header sum for TCP, UDP and ICMPv6
///
/// The IPv4 form is `src, dst, zero, protocol, length(16)`; the IPv6 form
/// is `src, dst, length(32), zero(24), next header`. Both reduce to the same
/// word sum as long as `length` fits in 16 bits, which it always does for a
/// non-jumbo packet. Mixed families contribute their own address widths.
#[must_use]
pub fn pseudo_header(src: &IpAddr, dst: &IpAddr, protocol: u8, length: usize) -> u32 {
    let mut acc = 0u32;
    acc = match src {
        IpAddr::V4(v4) => sum(acc, &v4.octets()),
        IpAddr::V6(v6) => sum(acc, &v6.octets()),
    };
    acc = match dst {
        IpAddr::V4(v4) => sum(acc, &v4.octets()),
        IpAddr::V6(v6) => sum(acc, &v6.octets()),
    };
    let length = length as u32;
    acc.wrapping_add(u32::from(protocol))
        .wrapping_add(length >> 16)
        .wrapping_add(length & 0xffff)
}

/// Checksum of a transport segment (TCP, UDP or ICMPv6) with the
/// checksum field already zeroed.
#[must_use]
pub fn transport(src: &IpAddr, dst: &IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    checksum(pseudo_header(src, dst, protocol, segment.len()), segment)
}

/// Verify a transport segment that carries its checksum
#[must_use]
pub fn verify_transport(src: &IpAddr, dst: &IpAddr, protocol: u8, segment: &[u8]) -> bool {
    verify(pseudo_header(src, dst, protocol, segment.len()), segment)
}
