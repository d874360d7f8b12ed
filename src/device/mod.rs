//! Packet device boundary
//!
//! The engine reads whole IP packets from a [`PacketDevice`] and writes
//! whole IP packets back. Implementations must accept concurrent `send`
//! calls from the pump, UDP write-backs and the pull socket, and each
//! `send` must emit exactly one packet.
//!
//! - [`TunDevice`]: a real TUN file descriptor driven by `AsyncFd`
//! - [`ChannelDevice`]: an in-memory device for tests and embedders

mod channel;
mod tun;

use std::io;

use async_trait::async_trait;

use crate::error::DeviceError;

pub use channel::{ChannelDevice, DeviceHandle};
pub use tun::TunDevice;

/// A source and sink of raw IP packets
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Read one packet into `buf`, returning its length
    ///
    /// Packets longer than `buf` are truncated. Returns an error of kind
    /// `BrokenPipe` once the device is closed.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    /// Wake pending `recv` calls with a closed error; later calls fail
    fn close(&self);
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device closed")
}

/// True for the error returned by a closed device
pub fn is_closed_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::BrokenPipe
}

/// Classify a failed device write
pub(crate) fn write_error(e: io::Error) -> DeviceError {
    if is_closed_error(&e) {
        DeviceError::Closed
    } else {
        DeviceError::Io(e)
    }
}
