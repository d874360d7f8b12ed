//! TCP redirection through the stub listener

use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use tun_nat::packet::build;
use tun_nat::packet::tcp::flags;
use tun_nat::session::SessionState;

use super::{addr, endpoints, eventually, test_config, Harness, GATEWAY, PORTAL};

const CLIENT: &str = "10.0.0.2:51000";
const REMOTE: &str = "1.2.3.4:443";

fn syn(src: &str, dst: &str) -> bytes::BytesMut {
    build::tcp_segment(addr(src), addr(dst), flags::SYN, 1000, 0, b"").unwrap()
}

/// Inject a SYN and return the session port it was redirected through
async fn redirect_syn(harness: &mut Harness, src: &str, dst: &str) -> u16 {
    harness.inject(syn(src, dst)).await;
    let redirected = harness.written().await;
    assert!(build::checksums_valid(&redirected));

    let (from, to) = endpoints(&redirected);
    assert_eq!(from.ip(), IpAddr::V4(PORTAL));
    assert_eq!(to, SocketAddr::new(IpAddr::V4(GATEWAY), harness.listener_port()));
    from.port()
}

/// Connect to the stub listener the way the kernel would for a redirected SYN
async fn connect_as_portal(port: u16, listener: SocketAddr) -> TcpStream {
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_reuseaddr(true).unwrap();
    socket
        .bind(SocketAddr::new(IpAddr::V4(PORTAL), port))
        .unwrap();
    socket.connect(listener).await.unwrap()
}

#[tokio::test]
async fn test_syn_to_accepted_connection() {
    let mut harness = Harness::start(test_config()).await;
    let port = redirect_syn(&mut harness, CLIENT, REMOTE).await;
    assert_eq!(
        harness.engine.sessions().session(port).unwrap().state,
        SessionState::Pending
    );

    let mut client = connect_as_portal(port, harness.engine.listener_addr()).await;
    let mut accepted = harness.next_connection().await;
    assert_eq!(accepted.source, addr(CLIENT));
    assert_eq!(accepted.destination, addr(REMOTE));
    assert_eq!(accepted.conn.local_addr(), addr(CLIENT));
    assert_eq!(accepted.conn.peer_addr(), addr(REMOTE));
    assert_eq!(accepted.conn.session_port(), port);
    assert_eq!(harness.engine.sessions().active_count(), 1);

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    accepted.conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    accepted.conn.write_all(b"world").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    assert!(harness.connections.try_recv().is_err(), "handler called twice");
    assert_eq!(harness.engine.stats().snapshot().connections_accepted, 1);
}

#[tokio::test]
async fn test_closed_connection_evicted_after_linger() {
    let mut harness = Harness::start(test_config()).await;
    let port = redirect_syn(&mut harness, CLIENT, REMOTE).await;

    let client = connect_as_portal(port, harness.engine.listener_addr()).await;
    let accepted = harness.next_connection().await;
    drop(accepted);
    drop(client);

    let sessions = std::sync::Arc::clone(harness.engine.sessions());
    eventually("session eviction", || sessions.is_empty()).await;

    // Same tuple again gets a fresh session
    let _ = redirect_syn(&mut harness, CLIENT, REMOTE).await;
    assert_eq!(sessions.len(), 1);
}

#[tokio::test]
async fn test_reply_restored_to_original_tuple() {
    let mut harness = Harness::start(test_config()).await;
    let port = redirect_syn(&mut harness, CLIENT, REMOTE).await;

    let listener = SocketAddr::new(IpAddr::V4(GATEWAY), harness.listener_port());
    let portal = SocketAddr::new(IpAddr::V4(PORTAL), port);
    let syn_ack =
        build::tcp_segment(listener, portal, flags::SYN | flags::ACK, 5000, 1001, b"").unwrap();
    harness.inject(syn_ack).await;

    let restored = harness.written().await;
    assert!(build::checksums_valid(&restored));
    assert_eq!(endpoints(&restored), (addr(REMOTE), addr(CLIENT)));

    // Follow-up segments of the client reuse the session
    let ack = build::tcp_segment(addr(CLIENT), addr(REMOTE), flags::ACK, 1001, 5001, b"data")
        .unwrap();
    harness.inject(ack).await;
    let redirected = harness.written().await;
    assert_eq!(endpoints(&redirected).0.port(), port);

    let stats = harness.engine.stats().snapshot();
    assert_eq!(stats.tcp_redirected, 2);
    assert_eq!(stats.tcp_replies, 1);
}

#[tokio::test]
async fn test_ipv6_redirect_and_restore() {
    let mut harness = Harness::start(test_config()).await;
    let config = test_config();

    harness
        .inject(syn("[fd00::2]:51000", "[2606:4700::1111]:443"))
        .await;
    let redirected = harness.written().await;
    assert!(build::checksums_valid(&redirected));
    let (from, to) = endpoints(&redirected);
    assert_eq!(from.ip(), IpAddr::V6(config.portal_v6));
    assert_eq!(to.ip(), IpAddr::V6(config.gateway_v6));

    let syn_ack = build::tcp_segment(to, from, flags::SYN | flags::ACK, 1, 1001, b"").unwrap();
    harness.inject(syn_ack).await;
    let restored = harness.written().await;
    assert_eq!(
        endpoints(&restored),
        (addr("[2606:4700::1111]:443"), addr("[fd00::2]:51000"))
    );
}

#[tokio::test]
async fn test_segment_without_session_dropped() {
    let mut harness = Harness::start(test_config()).await;
    let ack = build::tcp_segment(addr(CLIENT), addr(REMOTE), flags::ACK, 1, 1, b"").unwrap();
    harness.inject(ack).await;

    let stray_reply = build::tcp_segment(
        SocketAddr::new(IpAddr::V4(GATEWAY), harness.listener_port()),
        SocketAddr::new(IpAddr::V4(PORTAL), 20500),
        flags::ACK,
        1,
        1,
        b"",
    )
    .unwrap();
    harness.inject(stray_reply).await;
    harness.fence().await;

    assert!(harness.engine.sessions().is_empty());
    assert_eq!(harness.engine.stats().snapshot().dropped_unknown_session, 2);
    assert!(harness.errors.lock().is_empty());
}

#[tokio::test]
async fn test_unmapped_connection_rejected() {
    let mut harness = Harness::start(test_config()).await;

    let mut client = connect_as_portal(20999, harness.engine.listener_addr()).await;
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(std::time::Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("rejected connection should be closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    let stats = std::sync::Arc::clone(harness.engine.stats());
    eventually("rejection", || stats.snapshot().connections_rejected == 1).await;
    assert!(harness.connections.try_recv().is_err());
    assert!(harness.errors.lock().is_empty());
}

#[tokio::test]
async fn test_fragmented_syn_dropped() {
    let mut harness = Harness::start(test_config()).await;
    let mut packet = syn(CLIENT, REMOTE);
    // more-fragments flag
    packet[6] |= 0x20;
    tun_nat::packet::Ipv4Packet::new_unchecked(&mut packet[..]).fill_checksum();
    harness.inject(packet).await;
    harness.fence().await;

    assert!(harness.engine.sessions().is_empty());
    assert_eq!(harness.engine.stats().snapshot().dropped_fragmented, 1);
}
