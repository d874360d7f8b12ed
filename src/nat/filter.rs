//! Destination scope filter
//!
//! Applied to every packet before protocol dispatch. Traffic to addresses
//! that cannot belong to a remote peer (unspecified, loopback, multicast,
//! broadcast, link-local) and to configured bypass ranges is dropped. The
//! portal itself is always in scope, since reply segments and pings to the
//! portal are addressed to it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

/// Decides which destinations the engine handles
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    portal_v4: Ipv4Addr,
    portal_v6: Ipv6Addr,
    bypass: Vec<IpNet>,
}

impl ScopeFilter {
    pub fn new(portal_v4: Ipv4Addr, portal_v6: Ipv6Addr, bypass: Vec<IpNet>) -> Self {
        Self {
            portal_v4,
            portal_v6,
            bypass,
        }
    }

    /// Whether packets to `dst` are handled
    pub fn allows(&self, dst: &IpAddr) -> bool {
        match dst {
            IpAddr::V4(v4) if *v4 == self.portal_v4 => return true,
            IpAddr::V6(v6) if *v6 == self.portal_v6 => return true,
            _ => {}
        }

        let special = match dst {
            IpAddr::V4(v4) => {
                v4.is_unspecified()
                    || v4.is_loopback()
                    || v4.is_multicast()
                    || v4.is_broadcast()
                    || v4.is_link_local()
            }
            IpAddr::V6(v6) => {
                v6.is_unspecified()
                    || v6.is_loopback()
                    || v6.is_multicast()
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
            }
        };
        if special {
            return false;
        }

        !self.bypass.iter().any(|net| net.contains(dst))
    }
}
