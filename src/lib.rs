//! tun-nat: user-space NAT between a TUN device and a proxy dispatcher
//!
//! Every TCP and UDP flow a client sends into a TUN interface is handed to
//! a [`Handler`] together with its original source and destination. Replies
//! are written back with headers rewritten so that the client believes it
//! is talking to the real remote host.
//!
//! # Architecture
//!
//! ```text
//! client ──► TUN ──► device pump ──┬─► TCP redirector ──► kernel ──► stub listener ──► Handler::new_connection
//!                                  ├─► UDP redirector ─────────────────────────────► Handler::new_packet
//!                                  └─► ICMP echo responder
//! ```
//!
//! TCP is never terminated in user space: SYNs are rewritten towards a local
//! listener so that the host kernel runs the TCP state machine, and the
//! session table maps each accepted connection back to its original tuple.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tun_nat::config::load_config;
//! use tun_nat::device::TunDevice;
//! use tun_nat::direct::DirectHandler;
//! use tun_nat::nat::NatEngine;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tun-nat/config.json")?;
//! let device = TunDevice::open("tun0")?;
//! let handler = Arc::new(DirectHandler::new(config.nat.udp_timeout()));
//!
//! let engine = NatEngine::builder(config.nat).start(device, handler).await?;
//! // ...
//! engine.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`device`]: TUN and in-memory packet devices
//! - [`direct`]: Handler that connects straight to the destination
//! - [`error`]: Error types
//! - [`flow`]: Single-flight flow table
//! - [`nat`]: The engine, redirectors and handler boundary
//! - [`packet`]: Zero-copy packet views and checksums
//! - [`session`]: TCP session table
//! - [`stats`]: Engine counters

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod device;
pub mod direct;
pub mod error;
pub mod flow;
pub mod nat;
pub mod packet;
pub mod session;
pub mod stats;

// Re-export commonly used types at the crate root
pub use config::{Config, NatConfig};
pub use device::{ChannelDevice, DeviceHandle, PacketDevice, TunDevice};
pub use direct::DirectHandler;
pub use error::{
    ConfigError, DeviceError, ListenerError, NatError, PacketError, Result, SessionError, UdpError,
};
pub use nat::{Handler, NatEngine, NatTcpStream, NatUdpSocket, UdpMessage, UdpWriteBack};
pub use session::{SessionTable, Tuple};
pub use stats::{NatStats, NatStatsSnapshot};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
