//! Pull-mode UDP socket
//!
//! Readers post a call with [`NatUdpSocket::read_from`] and park on it. The
//! pump hands each arriving datagram to the oldest pending call. A datagram
//! that finds no call is dropped: nothing is buffered, so callers keep
//! enough readers posted for their load.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::device::{write_error, PacketDevice};
use crate::error::{NatError, PacketError, UdpError};
use crate::packet::build;
use crate::stats::NatStats;

/// One datagram read from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// The client that sent it
    pub source: SocketAddr,
    /// Where the client sent it
    pub destination: SocketAddr,
    pub payload: Bytes,
}

#[derive(Default)]
struct State {
    pending: VecDeque<oneshot::Sender<Datagram>>,
    closed: bool,
}

/// Socket-like façade over the UDP traffic of the device
pub struct NatUdpSocket {
    device: Arc<dyn PacketDevice>,
    state: Mutex<State>,
    stats: Arc<NatStats>,
}

impl NatUdpSocket {
    pub(crate) fn new(device: Arc<dyn PacketDevice>, stats: Arc<NatStats>) -> Self {
        Self {
            device,
            state: Mutex::new(State::default()),
            stats,
        }
    }

    /// Wait for the next datagram
    ///
    /// # Errors
    ///
    /// Returns `UdpError::Closed` once the socket is closed, including for
    /// calls that were pending at the time.
    pub async fn recv(&self) -> Result<Datagram, NatError> {
        let rx = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(UdpError::Closed.into());
            }
            state.pending.retain(|tx| !tx.is_closed());
            let (tx, rx) = oneshot::channel();
            state.pending.push_back(tx);
            rx
        };
        rx.await.map_err(|_| UdpError::Closed.into())
    }

    /// Copy the next datagram into `buf`
    ///
    /// Returns the number of bytes copied with the datagram's source and
    /// destination. A payload longer than `buf` is truncated.
    ///
    /// # Errors
    ///
    /// Returns `UdpError::Closed` once the socket is closed.
    pub async fn read_from(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, SocketAddr, SocketAddr), NatError> {
        let datagram = self.recv().await?;
        let n = datagram.payload.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram.payload[..n]);
        Ok((n, datagram.source, datagram.destination))
    }

    /// Write `payload` to `client`, appearing to come from `source`
    ///
    /// # Errors
    ///
    /// Returns `UdpError::FamilyMismatch` for mixed address families,
    /// `UdpError::PayloadTooLarge` if the packet would not fit, and
    /// `UdpError::WriteBack` if the device write fails.
    pub async fn write_to(
        &self,
        payload: &[u8],
        source: SocketAddr,
        client: SocketAddr,
    ) -> Result<usize, NatError> {
        if self.is_closed() {
            return Err(UdpError::Closed.into());
        }
        let source = SocketAddr::new(source.ip().to_canonical(), source.port());
        let client = SocketAddr::new(client.ip().to_canonical(), client.port());
        if source.is_ipv4() != client.is_ipv4() {
            return Err(UdpError::FamilyMismatch {
                source_addr: source,
                client,
            }
            .into());
        }

        let packet = build::udp_datagram(source, client, payload).map_err(|e| match e {
            PacketError::TooLarge(_) => NatError::Udp(UdpError::PayloadTooLarge(payload.len())),
            other => NatError::Packet(other),
        })?;
        self.device
            .send(&packet)
            .await
            .map_err(|e| UdpError::WriteBack(write_error(e)))?;
        self.stats.record_udp_reply();
        trace!(%source, %client, len = payload.len(), "UDP reply written");
        Ok(payload.len())
    }

    /// Hand a datagram to the oldest pending reader
    ///
    /// Readers whose futures were dropped are skipped. Returns `false` if no
    /// reader took it.
    pub(crate) fn deliver(&self, mut datagram: Datagram) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        while let Some(tx) = state.pending.pop_front() {
            match tx.send(datagram) {
                Ok(()) => return true,
                Err(returned) => datagram = returned,
            }
        }
        false
    }

    /// Fail every pending and future read with `UdpError::Closed`
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            let woken = state.pending.len();
            state.pending.clear();
            debug!(woken, "UDP socket closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of posted reads still waiting to be served
    pub fn pending_readers(&self) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl fmt::Debug for NatUdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NatUdpSocket")
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}
