//! UDP delivery and write-back

use tun_nat::config::UdpMode;
use tun_nat::error::{NatError, UdpError};
use tun_nat::packet::{build, Ipv4Packet, IpPacket, UdpPacket};

use super::{addr, endpoints, test_config, Harness};

const CLIENT: &str = "10.0.0.2:5353";
const RESOLVER: &str = "1.1.1.1:53";

fn datagram(src: &str, dst: &str, payload: &[u8]) -> bytes::BytesMut {
    build::udp_datagram(addr(src), addr(dst), payload).unwrap()
}

fn payload_of(packet: &[u8]) -> Vec<u8> {
    let ip = IpPacket::new_checked(packet).unwrap();
    UdpPacket::new_checked(ip.payload()).unwrap().payload().to_vec()
}

#[tokio::test]
async fn test_push_delivery_and_reply() {
    let mut harness = Harness::start(test_config()).await;
    harness.inject(datagram(CLIENT, RESOLVER, b"query")).await;

    let packet = harness.next_packet().await;
    assert_eq!(packet.source, addr(CLIENT));
    assert_eq!(packet.destination, addr(RESOLVER));
    assert_eq!(packet.message.payload(), b"query");
    assert_eq!(packet.message.write_back().client(), addr(CLIENT));

    let written = packet.message.write_back().write(b"answer", None).await.unwrap();
    assert_eq!(written, 6);
    let reply = harness.written().await;
    assert!(build::checksums_valid(&reply));
    assert_eq!(endpoints(&reply), (addr(RESOLVER), addr(CLIENT)));
    assert_eq!(payload_of(&reply), b"answer");

    // Full-cone reply from another remote
    packet
        .message
        .write_back()
        .write(b"other", Some(addr("9.9.9.9:53")))
        .await
        .unwrap();
    let reply = harness.written().await;
    assert_eq!(endpoints(&reply), (addr("9.9.9.9:53"), addr(CLIENT)));

    let stats = harness.engine.stats().snapshot();
    assert_eq!(stats.udp_datagrams, 1);
    assert_eq!(stats.udp_replies, 2);
}

#[tokio::test]
async fn test_replies_keep_handler_order() {
    let mut harness = Harness::start(test_config()).await;
    harness.inject(datagram(CLIENT, RESOLVER, b"q")).await;
    let packet = harness.next_packet().await;

    for i in 0..10u8 {
        packet.message.write_back().write(&[i], None).await.unwrap();
    }
    for i in 0..10u8 {
        assert_eq!(payload_of(&harness.written().await), vec![i]);
    }
}

#[tokio::test]
async fn test_ipv6_datagram() {
    let mut harness = Harness::start(test_config()).await;
    harness
        .inject(datagram("[fd00::2]:5353", "[2001:4860:4860::8888]:53", b"v6"))
        .await;

    let packet = harness.next_packet().await;
    assert_eq!(packet.destination, addr("[2001:4860:4860::8888]:53"));
    packet.message.write_back().write(b"ok", None).await.unwrap();
    let reply = harness.written().await;
    assert!(build::checksums_valid(&reply));
    assert_eq!(
        endpoints(&reply),
        (addr("[2001:4860:4860::8888]:53"), addr("[fd00::2]:5353"))
    );

    let err = packet
        .message
        .write_back()
        .write(b"x", Some(addr("1.1.1.1:53")))
        .await
        .unwrap_err();
    assert!(matches!(err, NatError::Udp(UdpError::FamilyMismatch { .. })));
}

#[tokio::test]
async fn test_fragment_never_reaches_handler() {
    let mut harness = Harness::start(test_config()).await;
    let mut packet = datagram(CLIENT, RESOLVER, b"fragment");
    // more-fragments flag
    packet[6] |= 0x20;
    Ipv4Packet::new_unchecked(&mut packet[..]).fill_checksum();
    harness.inject(packet).await;

    let mut packet = datagram(CLIENT, RESOLVER, b"offset");
    // fragment offset 8 bytes
    packet[7] = 1;
    Ipv4Packet::new_unchecked(&mut packet[..]).fill_checksum();
    harness.inject(packet).await;
    harness.fence().await;

    assert!(harness.packets.try_recv().is_err());
    assert_eq!(harness.engine.stats().snapshot().dropped_fragmented, 2);
}

#[tokio::test]
async fn test_inconsistent_length_dropped() {
    let mut harness = Harness::start(test_config()).await;
    let mut packet = datagram(CLIENT, RESOLVER, b"short");
    // UDP length claims more than the IP payload holds
    packet[24] = 0x01;
    packet[25] = 0x00;
    harness.inject(packet).await;
    harness.fence().await;

    assert!(harness.packets.try_recv().is_err());
    assert_eq!(harness.engine.stats().snapshot().dropped_malformed, 1);
}

#[tokio::test]
async fn test_out_of_scope_destinations_dropped() {
    let mut config = test_config();
    config.bypass_ranges = vec!["192.168.0.0/16".parse().unwrap()];
    let mut harness = Harness::start(config).await;

    harness.inject(datagram(CLIENT, "224.0.0.251:5353", b"mdns")).await;
    harness.inject(datagram(CLIENT, "255.255.255.255:67", b"dhcp")).await;
    harness.inject(datagram(CLIENT, "192.168.1.1:53", b"lan")).await;
    harness.fence().await;

    assert!(harness.packets.try_recv().is_err());
    assert_eq!(harness.engine.stats().snapshot().dropped_filtered, 3);
}

#[tokio::test]
async fn test_pull_mode_delivery_and_reply() {
    let mut config = test_config();
    config.udp_mode = UdpMode::Pull;
    config.udp_readers = 2;
    let mut harness = Harness::start(config).await;

    let socket = std::sync::Arc::clone(harness.engine.udp_socket().expect("pull mode socket"));
    super::eventually("posted readers", || socket.pending_readers() >= 2).await;

    harness.inject(datagram(CLIENT, RESOLVER, b"pulled")).await;
    let packet = harness.next_packet().await;
    assert_eq!(packet.source, addr(CLIENT));
    assert_eq!(packet.message.payload(), b"pulled");

    packet.message.write_back().write(b"pushed back", None).await.unwrap();
    let reply = harness.written().await;
    assert!(build::checksums_valid(&reply));
    assert_eq!(endpoints(&reply), (addr(RESOLVER), addr(CLIENT)));
    assert_eq!(payload_of(&reply), b"pushed back");
}

#[tokio::test]
async fn test_pull_mode_close_fails_readers() {
    let mut config = test_config();
    config.udp_mode = UdpMode::Pull;
    let harness = Harness::start(config).await;
    let socket = std::sync::Arc::clone(harness.engine.udp_socket().unwrap());

    harness.engine.close().await;
    assert!(socket.is_closed());
    assert!(socket.recv().await.unwrap_err().is_shutdown());
    assert!(harness.errors.lock().is_empty());
}
