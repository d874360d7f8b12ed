//! ICMP echo responder
//!
//! Echo requests are answered in place: the addresses are swapped, the type
//! flipped to echo reply and the checksums refreshed. Nothing else about
//! ICMP is handled.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::trace;

use crate::config::IcmpEchoPolicy;
use crate::packet::build::DEFAULT_TTL;
use crate::packet::{icmp, ip_proto, IcmpPacket, IpPacket};

#[derive(Debug, Clone)]
pub(crate) struct EchoResponder {
    policy: IcmpEchoPolicy,
    portal_v4: Ipv4Addr,
    portal_v6: Ipv6Addr,
}

impl EchoResponder {
    pub fn new(policy: IcmpEchoPolicy, portal_v4: Ipv4Addr, portal_v6: Ipv6Addr) -> Self {
        Self {
            policy,
            portal_v4,
            portal_v6,
        }
    }

    fn wants(&self, dst: &IpAddr) -> bool {
        match self.policy {
            IcmpEchoPolicy::Off => false,
            IcmpEchoPolicy::All => true,
            IcmpEchoPolicy::Portal => match dst {
                IpAddr::V4(v4) => *v4 == self.portal_v4,
                IpAddr::V6(v6) => *v6 == self.portal_v6,
            },
        }
    }

    /// Turn an echo request into its reply
    ///
    /// Returns `false`, leaving the buffer untouched, for anything that is not
    /// a well-formed echo request this responder answers.
    pub fn answer<T: AsRef<[u8]> + AsMut<[u8]>>(&self, ip: &mut IpPacket<T>) -> bool {
        let (src, dst) = (ip.src_addr(), ip.dst_addr());
        let (request, reply) = match ip.protocol() {
            ip_proto::ICMP if ip.is_ipv4() => (icmp::ECHO_REQUEST_V4, icmp::ECHO_REPLY_V4),
            ip_proto::ICMPV6 if !ip.is_ipv4() => (icmp::ECHO_REQUEST_V6, icmp::ECHO_REPLY_V6),
            _ => return false,
        };
        let Ok(message) = IcmpPacket::new_checked(ip.payload()) else {
            return false;
        };
        let valid = if ip.is_ipv4() {
            message.verify_checksum_v4()
        } else {
            message.verify_checksum_v6(&src, &dst)
        };
        if message.msg_type() != request || message.code() != 0 || !valid || !self.wants(&dst) {
            return false;
        }
        let (ident, seq) = (message.ident(), message.seq());

        ip.swap_addrs();
        match ip {
            IpPacket::V4(p) => p.set_ttl(DEFAULT_TTL),
            IpPacket::V6(p) => p.set_hop_limit(DEFAULT_TTL),
        }
        let is_ipv4 = ip.is_ipv4();
        let mut message = IcmpPacket::new_unchecked(ip.payload_mut());
        message.set_msg_type(reply);
        if is_ipv4 {
            message.fill_checksum_v4();
        } else {
            message.fill_checksum_v6(&dst, &src);
        }
        ip.fill_checksum();
        trace!(%src, %dst, ident, seq, "ICMP echo answered");
        true
    }
}
