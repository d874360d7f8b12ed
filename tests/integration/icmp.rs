//! ICMP echo through the engine

use std::net::IpAddr;

use tun_nat::config::IcmpEchoPolicy;
use tun_nat::packet::{build, icmp, IcmpPacket, IpPacket};

use super::{test_config, Harness, PORTAL};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_echo_to_portal() {
    let mut harness = Harness::start(test_config()).await;
    let request = build::icmp_echo(ip("10.0.0.2"), IpAddr::V4(PORTAL), true, 0x1234, 1, b"abc")
        .unwrap();
    harness.inject(request).await;

    let reply = harness.written().await;
    assert!(build::checksums_valid(&reply));
    let packet = IpPacket::new_checked(&reply[..]).unwrap();
    assert_eq!(packet.src_addr(), IpAddr::V4(PORTAL));
    assert_eq!(packet.dst_addr(), ip("10.0.0.2"));
    let message = IcmpPacket::new_checked(packet.payload()).unwrap();
    assert_eq!(message.msg_type(), icmp::ECHO_REPLY_V4);
    assert_eq!(message.ident(), 0x1234);
    assert_eq!(message.seq(), 1);
    assert_eq!(message.data(), b"abc");
    assert_eq!(harness.engine.stats().snapshot().icmp_echo_replies, 1);
}

#[tokio::test]
async fn test_echo_to_remote_ignored_by_default() {
    let mut harness = Harness::start(test_config()).await;
    let request = build::icmp_echo(ip("10.0.0.2"), ip("8.8.8.8"), true, 1, 1, b"").unwrap();
    harness.inject(request).await;
    harness.fence().await;
    assert_eq!(harness.engine.stats().snapshot().icmp_echo_replies, 1);
}

#[tokio::test]
async fn test_echo_all_policy() {
    let mut config = test_config();
    config.icmp_echo = IcmpEchoPolicy::All;
    let mut harness = Harness::start(config).await;

    let request = build::icmp_echo(ip("fd00::2"), ip("2001:db8::1"), true, 7, 3, b"v6").unwrap();
    harness.inject(request).await;

    let reply = harness.written().await;
    assert!(build::checksums_valid(&reply));
    let packet = IpPacket::new_checked(&reply[..]).unwrap();
    assert_eq!(packet.src_addr(), ip("2001:db8::1"));
    let message = IcmpPacket::new_checked(packet.payload()).unwrap();
    assert_eq!(message.msg_type(), icmp::ECHO_REPLY_V6);
    assert_eq!((message.ident(), message.seq()), (7, 3));
}
