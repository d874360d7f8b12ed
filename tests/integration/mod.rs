//! Integration tests for tun-nat
//!
//! # Test Organization
//!
//! - `tcp_redirect`: SYN redirection, accept recovery and reply restoration
//! - `udp`: push and pull UDP delivery and write-back
//! - `icmp`: echo answering through the engine
//! - `session`: bijection, exhaustion and engine lifecycle
//!
//! # Test Requirements
//!
//! The TCP tests bind sockets on 127.0.0.2, which Linux routes over
//! loopback without extra setup.

pub mod icmp;
pub mod session;
pub mod tcp_redirect;
pub mod udp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tun_nat::config::NatConfig;
use tun_nat::device::{ChannelDevice, DeviceHandle};
use tun_nat::nat::{Handler, NatEngine, NatTcpStream, UdpMessage};
use tun_nat::packet::{build, icmp as packet_icmp, IcmpPacket, IpPacket, TcpPacket, UdpPacket};

pub const PORTAL: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);
pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

const WAIT: Duration = Duration::from_secs(5);

/// Engine configuration usable without a real TUN interface
pub fn test_config() -> NatConfig {
    NatConfig {
        portal_v4: PORTAL,
        gateway_v4: GATEWAY,
        listen_addr: Some(SocketAddr::new(IpAddr::V4(GATEWAY), 0)),
        session_port_range: (20000, 20999),
        tcp_linger_ms: 50,
        sweep_interval_ms: 10,
        ..NatConfig::default()
    }
}

pub struct Connection {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub conn: NatTcpStream,
}

pub struct Packet {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub message: UdpMessage,
}

/// Handler that forwards everything it receives to the test
pub struct RecordingHandler {
    connections: mpsc::UnboundedSender<Connection>,
    packets: mpsc::UnboundedSender<Packet>,
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn new_connection(&self, source: SocketAddr, destination: SocketAddr, conn: NatTcpStream) {
        let _ = self.connections.send(Connection {
            source,
            destination,
            conn,
        });
    }

    async fn new_packet(&self, source: SocketAddr, destination: SocketAddr, message: UdpMessage) {
        let _ = self.packets.send(Packet {
            source,
            destination,
            message,
        });
    }
}

pub struct Harness {
    pub engine: NatEngine,
    pub device: DeviceHandle,
    pub connections: mpsc::UnboundedReceiver<Connection>,
    pub packets: mpsc::UnboundedReceiver<Packet>,
    pub errors: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    pub async fn start(config: NatConfig) -> Self {
        let (device, handle) = ChannelDevice::pair(256);
        let (conn_tx, connections) = mpsc::unbounded_channel();
        let (packet_tx, packets) = mpsc::unbounded_channel();
        let handler = Arc::new(RecordingHandler {
            connections: conn_tx,
            packets: packet_tx,
        });
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);

        let engine = NatEngine::builder(config)
            .error_sink(move |e| sink.lock().push(e.to_string()))
            .start(device, handler)
            .await
            .expect("engine should start");

        Self {
            engine,
            device: handle,
            connections,
            packets,
            errors,
        }
    }

    pub fn listener_port(&self) -> u16 {
        self.engine.listener_addr().port()
    }

    pub async fn inject(&self, packet: impl Into<Bytes>) {
        self.device.inject(packet).await.expect("device open");
    }

    pub async fn written(&mut self) -> Bytes {
        tokio::time::timeout(WAIT, self.device.next_written())
            .await
            .expect("timed out waiting for a written packet")
            .expect("device closed")
    }

    /// Ping the portal and require the reply to be the next written packet
    ///
    /// The pump handles packets in order, so everything injected before the
    /// fence has been fully processed once it returns.
    pub async fn fence(&mut self) {
        let ping = build::icmp_echo(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)),
            IpAddr::V4(PORTAL),
            true,
            0xfeed,
            0,
            b"fence",
        )
        .unwrap();
        self.inject(ping).await;

        let written = self.written().await;
        let ip = IpPacket::new_checked(&written[..]).unwrap();
        let message = IcmpPacket::new_checked(ip.payload()).expect("expected the fence reply");
        assert_eq!(message.msg_type(), packet_icmp::ECHO_REPLY_V4, "unexpected packet before fence");
        assert_eq!(message.ident(), 0xfeed, "unexpected packet before fence");
    }

    pub async fn next_connection(&mut self) -> Connection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("handler dropped")
    }

    pub async fn next_packet(&mut self) -> Packet {
        tokio::time::timeout(WAIT, self.packets.recv())
            .await
            .expect("timed out waiting for a datagram")
            .expect("handler dropped")
    }
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Transport endpoints of a TCP or UDP packet
pub fn endpoints(packet: &[u8]) -> (SocketAddr, SocketAddr) {
    let ip = IpPacket::new_checked(packet).unwrap();
    let (src_port, dst_port) = match ip.protocol() {
        6 => {
            let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
            (tcp.src_port(), tcp.dst_port())
        }
        17 => {
            let udp = UdpPacket::new_checked(ip.payload()).unwrap();
            (udp.src_port(), udp.dst_port())
        }
        other => panic!("no ports for protocol {other}"),
    };
    (
        SocketAddr::new(ip.src_addr(), src_port),
        SocketAddr::new(ip.dst_addr(), dst_port),
    )
}

/// Poll `check` until it holds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
