//! Direct handler
//!
//! A [`Handler`] that connects straight to the original destination from
//! the host. TCP connections are spliced with `copy_bidirectional`. UDP
//! uses one unconnected socket per client address, so replies from any
//! remote reach the client with that remote as their source.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace, warn};

use crate::flow::FlowTable;
use crate::nat::{Handler, NatTcpStream, UdpMessage, UdpWriteBack};

/// TCP connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest datagram relayed back to a client
const UDP_RECV_BUFFER_SIZE: usize = 65535;

/// Outbound socket of one UDP client
#[derive(Debug)]
struct UdpFlow {
    socket: UdpSocket,
    last_active: Mutex<Instant>,
}

impl UdpFlow {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

/// Forwards redirected traffic from the host's own network stack
#[derive(Debug)]
pub struct DirectHandler {
    flows: Arc<FlowTable<SocketAddr, Arc<UdpFlow>>>,
    udp_timeout: Duration,
}

impl DirectHandler {
    pub fn new(udp_timeout: Duration) -> Self {
        Self {
            flows: Arc::new(FlowTable::new()),
            udp_timeout,
        }
    }

    /// Number of UDP clients with an open outbound socket
    pub fn udp_flows(&self) -> usize {
        self.flows.len()
    }

    async fn open_flow(
        &self,
        client: SocketAddr,
        destination: SocketAddr,
        write_back: UdpWriteBack,
    ) -> io::Result<Arc<UdpFlow>> {
        let bind: SocketAddr = if destination.is_ipv4() {
            (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into()
        } else {
            (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        debug!(%client, local = %socket.local_addr()?, "UDP flow opened");

        let flow = Arc::new(UdpFlow {
            socket,
            last_active: Mutex::new(Instant::now()),
        });
        tokio::spawn(relay_replies(
            Arc::clone(&flow),
            Arc::clone(&self.flows),
            client,
            write_back,
            self.udp_timeout,
        ));
        Ok(flow)
    }
}

#[async_trait]
impl Handler for DirectHandler {
    async fn new_connection(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        mut conn: NatTcpStream,
    ) {
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(destination));
        let mut remote = match connect.await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                debug!(%source, %destination, error = %e, "TCP connect failed");
                return;
            }
            Err(_) => {
                debug!(%source, %destination, "TCP connect timed out");
                return;
            }
        };
        if let Err(e) = remote.set_nodelay(true) {
            trace!(error = %e, "Failed to set TCP_NODELAY");
        }

        match tokio::io::copy_bidirectional(&mut conn, &mut remote).await {
            Ok((up, down)) => {
                debug!(%source, %destination, up, down, "TCP connection closed");
            }
            Err(e) => {
                debug!(%source, %destination, error = %e, "TCP connection ended with error");
            }
        }
    }

    async fn new_packet(&self, source: SocketAddr, destination: SocketAddr, message: UdpMessage) {
        let (payload, write_back) = message.into_parts();
        let flow = self
            .flows
            .get_or_try_init(source, || self.open_flow(source, destination, write_back))
            .await;

        match flow {
            Ok(flow) => {
                flow.touch();
                if let Err(e) = flow.socket.send_to(&payload, destination).await {
                    debug!(%source, %destination, error = %e, "UDP send failed");
                }
            }
            Err(e) => warn!(%source, error = %e, "Failed to open UDP flow"),
        }
    }
}

/// Copy datagrams from the outbound socket back to the client until the
/// flow has been idle for `timeout`
async fn relay_replies(
    flow: Arc<UdpFlow>,
    flows: Arc<FlowTable<SocketAddr, Arc<UdpFlow>>>,
    client: SocketAddr,
    write_back: UdpWriteBack,
    timeout: Duration,
) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
    loop {
        match tokio::time::timeout(timeout, flow.socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                flow.touch();
                if let Err(e) = write_back.write(&buf[..n], Some(from)).await {
                    if e.is_shutdown() {
                        break;
                    }
                    trace!(%client, %from, error = %e, "UDP reply dropped");
                }
            }
            Ok(Err(e)) => {
                debug!(%client, error = %e, "UDP flow receive failed");
                break;
            }
            Err(_) if flow.idle_for() >= timeout => break,
            Err(_) => {}
        }
    }

    flows.remove_if(&client, |f| Arc::ptr_eq(f, &flow));
    debug!(%client, "UDP flow closed");
}
