//! TCP redirection through the kernel stack
//!
//! Outbound segments from the client are rewritten to
//! `portal:session_port -> gateway:listener_port` and written back to the
//! device, so the kernel delivers them to the local stub listener and runs
//! the whole TCP state machine. Segments the kernel sends back from the
//! listener are rewritten to `original_destination -> original_source`.
//!
//! ```text
//! client ──SYN 10.0.0.2:51000 → 1.2.3.4:443──► pump
//!   pump ──SYN portal:S → gateway:L──────────► kernel ──► StubListener::accept
//! kernel ──SYN/ACK gateway:L → portal:S──────► pump
//!   pump ──SYN/ACK 1.2.3.4:443 → 10.0.0.2:51000──► client
//! ```
//!
//! When the listener accepts, the peer port is `S`; the session table maps
//! it back to the original tuple for the handler.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::engine::ErrorSink;
use super::handler::Handler;
use crate::error::{is_transient_io, ListenerError, NatError, SessionError};
use crate::packet::{IpPacket, TcpPacket};
use crate::session::{Session, SessionTable, Tuple};
use crate::stats::NatStats;

/// Accept backlog of the stub listener
const LISTEN_BACKLOG: i32 = 1024;

/// Which way a rewritten segment travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Client segment redirected to the stub listener
    Outbound,
    /// Listener segment restored to the original tuple
    Reply,
}

/// Portal and gateway addresses of both families
#[derive(Debug, Clone, Copy)]
pub(crate) struct Portal {
    pub portal_v4: Ipv4Addr,
    pub gateway_v4: Ipv4Addr,
    pub portal_v6: Ipv6Addr,
    pub gateway_v6: Ipv6Addr,
    pub ipv6_enabled: bool,
}

impl Portal {
    fn pair(&self, family: &IpAddr) -> Result<(IpAddr, IpAddr), SessionError> {
        match family {
            IpAddr::V4(_) => Ok((IpAddr::V4(self.portal_v4), IpAddr::V4(self.gateway_v4))),
            IpAddr::V6(_) if self.ipv6_enabled => {
                Ok((IpAddr::V6(self.portal_v6), IpAddr::V6(self.gateway_v6)))
            }
            IpAddr::V6(_) => Err(SessionError::Ipv6Disabled),
        }
    }

    fn portal_for(&self, family: &IpAddr) -> IpAddr {
        match family {
            IpAddr::V4(_) => IpAddr::V4(self.portal_v4),
            IpAddr::V6(_) => IpAddr::V6(self.portal_v6),
        }
    }
}

/// In-place rewriter for TCP segments read from the device
///
/// `stopped` is cancelled by the accept loop when it dies. From then on no
/// new session is allocated; segments of existing sessions still pass.
#[derive(Debug)]
pub(crate) struct TcpRedirector {
    sessions: Arc<SessionTable>,
    portal: Portal,
    listener_port: u16,
    stopped: CancellationToken,
}

impl TcpRedirector {
    pub fn new(
        sessions: Arc<SessionTable>,
        portal: Portal,
        listener_port: u16,
        stopped: CancellationToken,
    ) -> Self {
        Self {
            sessions,
            portal,
            listener_port,
            stopped,
        }
    }

    /// Rewrite one TCP segment in place
    ///
    /// On success the buffer holds a packet to write back to the device.
    /// Every error means "drop silently"; nothing is modified on error
    /// except when the rewrite itself fails half-way, which cannot happen
    /// for a segment that parsed.
    pub fn process<T: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        ip: &mut IpPacket<T>,
    ) -> Result<Direction, NatError> {
        let tcp = TcpPacket::new_checked(ip.payload())?;
        let (src_port, dst_port) = (tcp.src_port(), tcp.dst_port());
        let connection_request = tcp.is_connection_request();
        let (src, dst) = (ip.src_addr(), ip.dst_addr());
        let (portal, gateway) = self.portal.pair(&src)?;

        if dst == portal {
            if src != gateway || src_port != self.listener_port {
                return Err(SessionError::Stray(SocketAddr::new(src, src_port)).into());
            }
            let tuple = self
                .sessions
                .tuple_of(dst_port)
                .ok_or(SessionError::UnknownPort(dst_port))?;
            ip.rewrite_endpoints(tuple.destination(), tuple.source())?;
            trace!(tuple = %tuple, port = dst_port, "TCP reply restored");
            return Ok(Direction::Reply);
        }

        let tuple = Tuple::new(SocketAddr::new(src, src_port), SocketAddr::new(dst, dst_port));
        let port = match self.sessions.port_of(&tuple) {
            Some(port) => port,
            None if connection_request && self.stopped.is_cancelled() => {
                return Err(ListenerError::Stopped.into());
            }
            None if connection_request => self.sessions.new_session(tuple)?,
            None => return Err(SessionError::NoSession(tuple.to_string()).into()),
        };
        ip.rewrite_endpoints(
            SocketAddr::new(portal, port),
            SocketAddr::new(gateway, self.listener_port),
        )?;
        trace!(tuple = %tuple, port, "TCP segment redirected");
        Ok(Direction::Outbound)
    }
}

/// The local listener redirected segments are delivered to
#[derive(Debug)]
pub struct StubListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl StubListener {
    /// Bind the listener. An IPv6 wildcard address also accepts IPv4.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Bind` if the socket cannot be created or bound.
    pub fn bind(addr: SocketAddr) -> Result<Self, ListenerError> {
        let bind_err = |e: io::Error| ListenerError::Bind {
            addr,
            reason: e.to_string(),
        };

        let socket =
            Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
                .map_err(bind_err)?;
        if addr.is_ipv6() {
            socket.set_only_v6(false).map_err(bind_err)?;
        }
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

        let listener = TcpListener::from_std(socket.into()).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        info!(addr = %local_addr, "Stub listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Where the accept loop takes connections from
#[async_trait]
pub(crate) trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl Acceptor for StubListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Accepts redirected connections and hands them to the handler
pub(crate) struct AcceptLoop<L = StubListener> {
    pub listener: L,
    pub sessions: Arc<SessionTable>,
    pub portal: Portal,
    pub handler: Arc<dyn Handler>,
    pub stats: Arc<NatStats>,
    pub error_sink: ErrorSink,
    /// Cancelled when the loop dies on an accept error
    pub stopped: CancellationToken,
}

impl<L: Acceptor> AcceptLoop<L> {
    /// Run until shutdown or a non-transient accept error
    ///
    /// Shutdown is not an error and is never reported to the sink. A fatal
    /// accept error is reported once and stops new TCP redirection; UDP is
    /// unaffected.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let addr = self.listener.local_addr();
        info!(%addr, "TCP redirector started");
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => match self.recover(stream, peer) {
                    Ok(conn) => {
                        self.stats.record_accept();
                        let handler = Arc::clone(&self.handler);
                        let (source, destination) = (conn.local_addr(), conn.peer_addr());
                        debug!(%source, %destination, port = peer.port(), "Connection accepted");
                        tokio::spawn(async move {
                            handler.new_connection(source, destination, conn).await;
                        });
                    }
                    Err(e) => {
                        self.stats.record_reject();
                        warn!(error = %e, "Connection rejected");
                    }
                },
                Err(e) if is_transient_io(&e) => {
                    debug!(error = %e, "Transient accept error");
                }
                Err(e) => {
                    error!(error = %e, "TCP redirector stopped on accept error");
                    self.stopped.cancel();
                    (self.error_sink)(&NatError::Listener(ListenerError::Accept(e)));
                    break;
                }
            }
        }
        info!(%addr, "TCP redirector stopped");
    }

    /// Map an accepted connection back to its original tuple
    fn recover(&self, stream: TcpStream, peer: SocketAddr) -> Result<NatTcpStream, ListenerError> {
        let peer = SocketAddr::new(peer.ip().to_canonical(), peer.port());
        if peer.ip() != self.portal.portal_for(&peer.ip()) {
            return Err(ListenerError::Rejected {
                peer,
                reason: "peer is not the portal".into(),
            });
        }
        let session = self
            .sessions
            .attach(peer.port())
            .ok_or_else(|| ListenerError::Rejected {
                peer,
                reason: SessionError::UnknownPort(peer.port()).to_string(),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        if let Err(e) = SockRef::from(&stream).set_keepalive(false) {
            debug!(error = %e, "Failed to disable keep-alive");
        }

        Ok(NatTcpStream::new(stream, session, Arc::clone(&self.sessions)))
    }
}

/// Starts the linger window of a session when the connection goes away
#[derive(Debug)]
struct SessionLease {
    sessions: Arc<SessionTable>,
    port: u16,
    id: u64,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.sessions.release(self.port, self.id);
    }
}

/// An accepted, redirected TCP connection
///
/// Reads and writes go to the kernel socket. `local_addr` and `peer_addr`
/// report the client's original source and destination rather than the
/// portal and gateway. Dropping the stream releases its session into the
/// linger window.
#[derive(Debug)]
pub struct NatTcpStream {
    stream: TcpStream,
    source: SocketAddr,
    destination: SocketAddr,
    lease: SessionLease,
}

impl NatTcpStream {
    pub(crate) fn new(stream: TcpStream, session: Session, sessions: Arc<SessionTable>) -> Self {
        Self {
            stream,
            source: session.tuple.source(),
            destination: session.tuple.destination(),
            lease: SessionLease {
                sessions,
                port: session.port,
                id: session.id,
            },
        }
    }

    /// Original source (the client)
    pub const fn local_addr(&self) -> SocketAddr {
        self.source
    }

    /// Original destination
    pub const fn peer_addr(&self) -> SocketAddr {
        self.destination
    }

    /// Session port the connection was redirected through
    pub const fn session_port(&self) -> u16 {
        self.lease.port
    }

    /// The kernel-side socket
    pub const fn get_ref(&self) -> &TcpStream {
        &self.stream
    }
}

impl AsyncRead for NatTcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for NatTcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
