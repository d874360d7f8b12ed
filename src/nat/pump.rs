//! Device pump
//!
//! The single sequential reader of the device. Every packet is parsed,
//! filtered and dispatched by protocol here, so packets of one flow are
//! handled in arrival order. Handler work is spawned off the pump.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use super::engine::ErrorSink;
use super::filter::ScopeFilter;
use super::handler::{Handler, UdpMessage};
use super::icmp::EchoResponder;
use super::tcp::{Direction, TcpRedirector};
use super::udp::{ReplyTemplate, UdpWriteBack};
use super::udp_socket::{Datagram, NatUdpSocket};
use crate::device::{is_closed_error, PacketDevice};
use crate::error::{is_transient_io, DeviceError, ListenerError, NatError, SessionError};
use crate::packet::{ip_proto, IpPacket, UdpPacket};
use crate::stats::{DropReason, NatStats};

/// Where UDP datagrams go
pub(crate) enum UdpDispatch {
    /// Straight to `Handler::new_packet`
    Push,
    /// To the oldest pending reader of the socket
    Pull(Arc<NatUdpSocket>),
}

pub(crate) struct Pump {
    pub device: Arc<dyn PacketDevice>,
    pub filter: ScopeFilter,
    pub redirector: TcpRedirector,
    pub echo: EchoResponder,
    pub udp: UdpDispatch,
    pub handler: Arc<dyn Handler>,
    pub stats: Arc<NatStats>,
    pub error_sink: ErrorSink,
    pub mtu: usize,
    pub ipv6_enabled: bool,
}

impl Pump {
    /// Read packets until shutdown or the device closes
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(mtu = self.mtu, "Device pump started");
        let mut buf = vec![0u8; self.mtu];

        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                read = self.device.recv(&mut buf) => read,
            };

            match read {
                Ok(n) => {
                    self.stats.record_read();
                    self.process(&mut buf[..n]).await;
                }
                Err(e) if is_closed_error(&e) => {
                    debug!("Device closed");
                    break;
                }
                Err(e) if is_transient_io(&e) => {
                    trace!(error = %e, "Transient device read error");
                }
                Err(e) => {
                    error!(error = %e, "Device pump stopped on read error");
                    (self.error_sink)(&NatError::Device(DeviceError::Io(e)));
                    break;
                }
            }
        }
        info!("Device pump stopped");
    }

    /// Handle one packet read from the device
    pub async fn process(&self, buf: &mut [u8]) {
        let mut ip = match IpPacket::new_checked(&mut buf[..]) {
            Ok(ip) => ip,
            Err(e) => {
                trace!(error = %e, "Dropping malformed packet");
                self.stats.record_drop(DropReason::Malformed);
                return;
            }
        };

        if ip.is_fragment() {
            trace!(src = %ip.src_addr(), dst = %ip.dst_addr(), "Dropping fragment");
            self.stats.record_drop(DropReason::Fragmented);
            return;
        }

        let dst = ip.dst_addr();
        if (!ip.is_ipv4() && !self.ipv6_enabled) || !self.filter.allows(&dst) {
            trace!(%dst, "Dropping out-of-scope packet");
            self.stats.record_drop(DropReason::Filtered);
            return;
        }

        match ip.protocol() {
            ip_proto::TCP => self.handle_tcp(&mut ip).await,
            ip_proto::UDP => self.handle_udp(&ip),
            ip_proto::ICMP | ip_proto::ICMPV6 => {
                if self.echo.answer(&mut ip) {
                    self.stats.record_icmp_echo();
                    self.write(ip.packet()).await;
                }
            }
            protocol => {
                trace!(protocol, %dst, "Dropping unsupported protocol");
                self.stats.record_drop(DropReason::Malformed);
            }
        }
    }

    async fn handle_tcp(&self, ip: &mut IpPacket<&mut [u8]>) {
        match self.redirector.process(ip) {
            Ok(Direction::Outbound) => {
                self.stats.record_tcp_redirect();
                self.write(ip.packet()).await;
            }
            Ok(Direction::Reply) => {
                self.stats.record_tcp_reply();
                self.write(ip.packet()).await;
            }
            Err(NatError::Session(SessionError::Exhausted { in_use })) => {
                debug!(in_use, "Session ports exhausted, dropping SYN");
                self.stats.record_drop(DropReason::Exhausted);
                (self.error_sink)(&NatError::Session(SessionError::Exhausted { in_use }));
            }
            Err(NatError::Listener(ListenerError::Stopped)) => {
                trace!("TCP redirector stopped, dropping SYN");
                self.stats.record_drop(DropReason::RedirectorStopped);
            }
            Err(NatError::Session(SessionError::Ipv6Disabled)) => {
                self.stats.record_drop(DropReason::Filtered);
            }
            Err(NatError::Session(e)) => {
                trace!(error = %e, "Dropping TCP segment");
                self.stats.record_drop(DropReason::UnknownSession);
            }
            Err(e) => {
                trace!(error = %e, "Dropping malformed TCP segment");
                self.stats.record_drop(DropReason::Malformed);
            }
        }
    }

    fn handle_udp(&self, ip: &IpPacket<&mut [u8]>) {
        let udp = match UdpPacket::new_checked(ip.payload()) {
            Ok(udp) => udp,
            Err(e) => {
                trace!(error = %e, "Dropping malformed UDP datagram");
                self.stats.record_drop(DropReason::Malformed);
                return;
            }
        };
        let source = SocketAddr::new(ip.src_addr(), udp.src_port());
        let destination = SocketAddr::new(ip.dst_addr(), udp.dst_port());
        let payload = Bytes::copy_from_slice(udp.payload());
        self.stats.record_udp_datagram();

        match &self.udp {
            UdpDispatch::Push => {
                let template = ReplyTemplate::from_request(
                    ip,
                    source,
                    destination,
                    Arc::clone(&self.device),
                    Arc::clone(&self.stats),
                );
                let message = UdpMessage::new(payload, UdpWriteBack::template(template));
                let handler = Arc::clone(&self.handler);
                tokio::spawn(async move {
                    handler.new_packet(source, destination, message).await;
                });
            }
            UdpDispatch::Pull(socket) => {
                let datagram = Datagram {
                    source,
                    destination,
                    payload,
                };
                if !socket.deliver(datagram) {
                    trace!(%source, %destination, "No pending UDP reader, dropping datagram");
                    self.stats.record_drop(DropReason::NoReader);
                }
            }
        }
    }

    async fn write(&self, packet: &[u8]) {
        match self.device.send(packet).await {
            Ok(_) => self.stats.record_written(),
            Err(e) => trace!(error = %e, len = packet.len(), "Device write failed"),
        }
    }
}
