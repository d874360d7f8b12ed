//! In-memory packet device
//!
//! Packets injected through the [`DeviceHandle`] come out of
//! [`PacketDevice::recv`]; packets passed to [`PacketDevice::send`] come out
//! of [`DeviceHandle::next_written`].
//!
//! ```
//! use tun_nat::device::{ChannelDevice, PacketDevice};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (device, mut handle) = ChannelDevice::pair(16);
//! handle.inject(&b"\x45..."[..]).await.unwrap();
//!
//! let mut buf = [0u8; 64];
//! let n = device.recv(&mut buf).await.unwrap();
//! device.send(&buf[..n]).await.unwrap();
//! assert_eq!(handle.next_written().await.unwrap().len(), n);
//! # }
//! ```

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{closed_error, PacketDevice};

/// Channel-backed [`PacketDevice`]
#[derive(Debug)]
pub struct ChannelDevice {
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

/// The far end of a [`ChannelDevice`]
#[derive(Debug)]
pub struct DeviceHandle {
    inject: mpsc::Sender<Bytes>,
    written: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl ChannelDevice {
    /// Create a device and its handle, each direction buffering `capacity`
    /// packets.
    pub fn pair(capacity: usize) -> (Self, DeviceHandle) {
        let (inject, inbound) = mpsc::channel(capacity);
        let (outbound, written) = mpsc::channel(capacity);
        let closed = CancellationToken::new();
        (
            Self {
                inbound: Mutex::new(inbound),
                outbound,
                closed: closed.clone(),
            },
            DeviceHandle {
                inject,
                written,
                closed,
            },
        )
    }
}

#[async_trait]
impl PacketDevice for ChannelDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = tokio::select! {
            () = self.closed.cancelled() => return Err(closed_error()),
            inbound = self.inbound.lock() => inbound,
        };
        let packet = tokio::select! {
            () = self.closed.cancelled() => return Err(closed_error()),
            packet = inbound.recv() => packet.ok_or_else(closed_error)?,
        };
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.outbound
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| closed_error())?;
        Ok(packet.len())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl DeviceHandle {
    /// Deliver a packet to the device's reader
    ///
    /// # Errors
    ///
    /// Returns a `BrokenPipe` error once the device has been dropped.
    pub async fn inject(&self, packet: impl Into<Bytes>) -> io::Result<()> {
        self.inject
            .send(packet.into())
            .await
            .map_err(|_| closed_error())
    }

    /// Next packet the engine wrote, or `None` once the device is gone
    pub async fn next_written(&mut self) -> Option<Bytes> {
        self.written.recv().await
    }

    /// Next written packet if one is already queued
    pub fn try_next_written(&mut self) -> Option<Bytes> {
        self.written.try_recv().ok()
    }

    /// Close the device from the outside
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
