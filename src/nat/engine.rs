//! The NAT engine instance
//!
//! A [`NatEngine`] owns everything one device needs: the stub listener, the
//! session table, the counters and the background tasks. There is no
//! process-wide state; several engines can run side by side on different
//! devices as long as their portal addresses differ.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::ScopeFilter;
use super::handler::{Handler, UdpMessage};
use super::icmp::EchoResponder;
use super::pump::{Pump, UdpDispatch};
use super::tcp::{AcceptLoop, Portal, StubListener, TcpRedirector};
use super::udp::UdpWriteBack;
use super::udp_socket::NatUdpSocket;
use crate::config::{NatConfig, UdpMode};
use crate::device::PacketDevice;
use crate::error::{NatError, Result};
use crate::session::SessionTable;
use crate::stats::NatStats;

/// Callback that receives errors the engine cannot attribute to a single
/// packet: fatal listener or device failures and session exhaustion.
pub type ErrorSink = Arc<dyn Fn(&NatError) + Send + Sync>;

fn default_error_sink() -> ErrorSink {
    Arc::new(|e: &NatError| warn!(error = %e, "NAT engine error"))
}

/// Configures and starts a [`NatEngine`]
pub struct NatEngineBuilder {
    config: NatConfig,
    error_sink: ErrorSink,
}

impl NatEngineBuilder {
    /// Replace the default error sink, which logs at `warn`
    #[must_use]
    pub fn error_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(&NatError) + Send + Sync + 'static,
    {
        self.error_sink = Arc::new(sink);
        self
    }

    /// Bind the stub listener and start the engine on `device`
    ///
    /// # Errors
    ///
    /// Returns `NatError::Config` for an invalid configuration and
    /// `NatError::Listener` if the stub listener cannot be bound.
    pub async fn start<D, H>(self, device: D, handler: Arc<H>) -> Result<NatEngine>
    where
        D: PacketDevice + 'static,
        H: Handler,
    {
        let config = self.config;
        config.validate()?;

        let listener = StubListener::bind(config.listen_addr())?;
        let listener_addr = listener.local_addr();
        let (min_port, max_port) = config.session_port_range;
        let sessions = Arc::new(
            SessionTable::new(min_port, max_port)
                .with_reserved(listener_addr.port())
                .with_linger(config.linger())
                .with_idle_timeout(config.session_idle_timeout()),
        );

        #[allow(clippy::cast_possible_truncation)]
        let mtu = config.mtu as usize;
        let device: Arc<dyn PacketDevice> = Arc::new(device);
        let handler: Arc<dyn Handler> = handler;
        let stats = Arc::new(NatStats::new());
        let portal = Portal {
            portal_v4: config.portal_v4,
            gateway_v4: config.gateway_v4,
            portal_v6: config.portal_v6,
            gateway_v6: config.gateway_v6,
            ipv6_enabled: config.ipv6_enabled,
        };
        let (shutdown_tx, _) = broadcast::channel(1);
        let tcp_stopped = CancellationToken::new();
        let mut tasks = Vec::new();

        let udp_socket = match config.udp_mode {
            UdpMode::Push => None,
            UdpMode::Pull => Some(Arc::new(NatUdpSocket::new(
                Arc::clone(&device),
                Arc::clone(&stats),
            ))),
        };

        let pump = Pump {
            device: Arc::clone(&device),
            filter: ScopeFilter::new(
                config.portal_v4,
                config.portal_v6,
                config.bypass_ranges.clone(),
            ),
            redirector: TcpRedirector::new(
                Arc::clone(&sessions),
                portal,
                listener_addr.port(),
                tcp_stopped.clone(),
            ),
            echo: EchoResponder::new(config.icmp_echo, config.portal_v4, config.portal_v6),
            udp: udp_socket
                .as_ref()
                .map_or(UdpDispatch::Push, |s| UdpDispatch::Pull(Arc::clone(s))),
            handler: Arc::clone(&handler),
            stats: Arc::clone(&stats),
            error_sink: Arc::clone(&self.error_sink),
            mtu,
            ipv6_enabled: config.ipv6_enabled,
        };
        tasks.push(tokio::spawn(pump.run(shutdown_tx.subscribe())));

        let accept_loop = AcceptLoop {
            listener,
            sessions: Arc::clone(&sessions),
            portal,
            handler: Arc::clone(&handler),
            stats: Arc::clone(&stats),
            error_sink: Arc::clone(&self.error_sink),
            stopped: tcp_stopped,
        };
        tasks.push(tokio::spawn(accept_loop.run(shutdown_tx.subscribe())));

        tasks.push(tokio::spawn(sweep_sessions(
            Arc::clone(&sessions),
            config.sweep_interval(),
            shutdown_tx.subscribe(),
        )));

        if let Some(socket) = &udp_socket {
            for reader in 0..config.udp_readers {
                tasks.push(tokio::spawn(read_datagrams(
                    reader,
                    Arc::clone(socket),
                    Arc::clone(&handler),
                    shutdown_tx.subscribe(),
                )));
            }
        }

        info!(
            listener = %listener_addr,
            portal_v4 = %config.portal_v4,
            gateway_v4 = %config.gateway_v4,
            ipv6 = config.ipv6_enabled,
            udp_mode = ?config.udp_mode,
            "NAT engine started"
        );

        Ok(NatEngine {
            listener_addr,
            sessions,
            stats,
            device,
            udp_socket,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }
}

/// A running NAT engine bound to one packet device
///
/// Dropping the engine signals its tasks to stop; [`NatEngine::close`] also
/// waits for them and releases every session.
pub struct NatEngine {
    listener_addr: SocketAddr,
    sessions: Arc<SessionTable>,
    stats: Arc<NatStats>,
    device: Arc<dyn PacketDevice>,
    udp_socket: Option<Arc<NatUdpSocket>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl NatEngine {
    pub fn builder(config: NatConfig) -> NatEngineBuilder {
        NatEngineBuilder {
            config,
            error_sink: default_error_sink(),
        }
    }

    /// Local address of the stub listener
    pub const fn listener_addr(&self) -> SocketAddr {
        self.listener_addr
    }

    pub const fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub const fn stats(&self) -> &Arc<NatStats> {
        &self.stats
    }

    /// The pull-mode socket, or `None` in push mode
    pub fn udp_socket(&self) -> Option<&Arc<NatUdpSocket>> {
        self.udp_socket.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.device.close();
        if let Some(socket) = &self.udp_socket {
            socket.close();
        }
    }

    /// Stop the engine and wait for its tasks
    ///
    /// Closes the device and the stub listener, fails pending UDP reads and
    /// releases every session. Connections already handed to the handler
    /// stay open. Calling `close` again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(listener = %self.listener_addr, "Closing NAT engine");
        self.signal_shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(error = %e, "NAT engine task panicked");
                }
            }
        }

        let released = self.sessions.clear();
        info!(released, "NAT engine closed");
    }
}

impl Drop for NatEngine {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.signal_shutdown();
        }
    }
}

async fn sweep_sessions(
    sessions: Arc<SessionTable>,
    interval: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let evicted = sessions.sweep_at(Instant::now());
                if evicted > 0 {
                    debug!(evicted, remaining = sessions.len(), "Session sweep");
                }
            }
        }
    }
}

/// One pull-mode reader adapting the socket to `Handler::new_packet`
async fn read_datagrams(
    reader: usize,
    socket: Arc<NatUdpSocket>,
    handler: Arc<dyn Handler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let datagram = tokio::select! {
            _ = shutdown.recv() => break,
            datagram = socket.recv() => datagram,
        };
        match datagram {
            Ok(datagram) => {
                let write_back = UdpWriteBack::socket(
                    Arc::clone(&socket),
                    datagram.source,
                    datagram.destination,
                );
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handler
                        .new_packet(
                            datagram.source,
                            datagram.destination,
                            UdpMessage::new(datagram.payload, write_back),
                        )
                        .await;
                });
            }
            Err(e) if e.is_shutdown() => break,
            Err(e) => {
                warn!(reader, error = %e, "UDP reader stopped");
                break;
            }
        }
    }
    debug!(reader, "UDP reader exited");
}
