//! User-space NAT between a TUN device and a [`Handler`]
//!
//! The engine has four moving parts:
//!
//! - the device pump, the only reader of the device
//! - the TCP redirector, which bounces SYNs off the host kernel into a
//!   local stub listener and restores the replies
//! - the UDP redirector, either push (one handler call per datagram) or
//!   pull (a socket-like [`NatUdpSocket`])
//! - the ICMP echo responder
//!
//! # Example
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use tun_nat::config::NatConfig;
//! use tun_nat::device::ChannelDevice;
//! use tun_nat::nat::{Handler, NatEngine, NatTcpStream, UdpMessage};
//!
//! struct Discard;
//!
//! #[async_trait]
//! impl Handler for Discard {
//!     async fn new_connection(&self, _: SocketAddr, _: SocketAddr, _: NatTcpStream) {}
//!     async fn new_packet(&self, _: SocketAddr, _: SocketAddr, _: UdpMessage) {}
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> tun_nat::Result<()> {
//! let (device, _handle) = ChannelDevice::pair(256);
//! let engine = NatEngine::builder(NatConfig::default())
//!     .start(device, Arc::new(Discard))
//!     .await?;
//! println!("listener on {}", engine.listener_addr());
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

mod engine;
mod filter;
mod handler;
mod icmp;
mod pump;
mod tcp;
mod udp;
mod udp_socket;

pub use engine::{ErrorSink, NatEngine, NatEngineBuilder};
pub use filter::ScopeFilter;
pub use handler::{Handler, UdpMessage};
pub use tcp::{NatTcpStream, StubListener};
pub use udp::UdpWriteBack;
pub use udp_socket::{Datagram, NatUdpSocket};
