//! Handler boundary
//!
//! The engine hands every recovered TCP connection and every UDP datagram
//! to a [`Handler`]. Calls are made from spawned tasks, so a slow handler
//! never stalls the pump.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use super::tcp::NatTcpStream;
use super::udp::UdpWriteBack;

/// Receives redirected traffic
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// A TCP connection from `source` to `destination` was accepted
    async fn new_connection(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        conn: NatTcpStream,
    );

    /// A UDP datagram from `source` to `destination` arrived
    ///
    /// Replies go through `message.write_back()`, which addresses them to
    /// `source`.
    async fn new_packet(&self, source: SocketAddr, destination: SocketAddr, message: UdpMessage);
}

/// One UDP datagram handed to a [`Handler`]
#[derive(Debug, Clone)]
pub struct UdpMessage {
    payload: Bytes,
    write_back: UdpWriteBack,
}

impl UdpMessage {
    pub(crate) const fn new(payload: Bytes, write_back: UdpWriteBack) -> Self {
        Self {
            payload,
            write_back,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub const fn write_back(&self) -> &UdpWriteBack {
        &self.write_back
    }

    pub fn into_parts(self) -> (Bytes, UdpWriteBack) {
        (self.payload, self.write_back)
    }
}
