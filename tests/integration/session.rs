//! Session table invariants and engine lifecycle

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::Rng;

use tun_nat::error::SessionError;
use tun_nat::packet::build;
use tun_nat::packet::tcp::flags;
use tun_nat::session::{SessionTable, Tuple};

use super::{addr, test_config, Harness};

fn random_tuple(rng: &mut impl Rng) -> Tuple {
    Tuple::new(
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, rng.gen_range(1..8))),
            rng.gen_range(1024..1040),
        ),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 443),
    )
}

#[test]
fn test_bijection_under_random_operations() {
    let table = SessionTable::new(2000, 2063).with_reserved(2010);
    let mut rng = rand::thread_rng();
    let mut live: HashMap<Tuple, u16> = HashMap::new();

    for _ in 0..5000 {
        let tuple = random_tuple(&mut rng);
        if rng.gen_bool(0.6) {
            match table.new_session(tuple) {
                Ok(port) => {
                    assert_ne!(port, 2010, "reserved port allocated");
                    if let Some(existing) = live.insert(tuple, port) {
                        assert_eq!(existing, port, "tuple moved to another port");
                    }
                }
                Err(SessionError::Exhausted { .. }) => {
                    assert_eq!(live.len(), table.capacity());
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        } else {
            assert_eq!(table.evict(&tuple), live.remove(&tuple));
        }

        let mut ports = HashSet::new();
        for (tuple, port) in &live {
            assert_eq!(table.port_of(tuple), Some(*port));
            assert_eq!(table.tuple_of(*port), Some(*tuple));
            assert!(ports.insert(*port), "port {port} shared");
        }
        assert_eq!(table.len(), live.len());
    }
}

#[test]
fn test_evicted_port_no_longer_resolves() {
    let table = SessionTable::new(3000, 3001);
    let tuple = Tuple::new(addr("10.0.0.1:1000"), addr("1.1.1.1:80"));
    let port = table.new_session(tuple).unwrap();
    assert_eq!(table.evict(&tuple), Some(port));
    assert!(table.tuple_of(port).is_none());
    assert!(table.port_of(&tuple).is_none());
}

#[tokio::test]
async fn test_exhaustion_reported_to_error_sink() {
    let mut config = test_config();
    config.session_port_range = (20000, 20001);
    let mut harness = Harness::start(config).await;

    for client_port in [1000, 1001] {
        let syn = build::tcp_segment(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), client_port),
            addr("1.2.3.4:80"),
            flags::SYN,
            1,
            0,
            b"",
        )
        .unwrap();
        harness.inject(syn).await;
        let _ = harness.written().await;
    }

    let syn = build::tcp_segment(addr("10.0.0.2:1002"), addr("1.2.3.4:80"), flags::SYN, 1, 0, b"")
        .unwrap();
    harness.inject(syn).await;
    harness.fence().await;

    assert_eq!(harness.engine.sessions().len(), 2);
    assert_eq!(harness.engine.stats().snapshot().sessions_exhausted, 1);
    let errors = harness.errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("exhausted"), "{}", errors[0]);
}

#[tokio::test]
async fn test_close_releases_everything_quietly() {
    let mut harness = Harness::start(test_config()).await;
    let syn = build::tcp_segment(addr("10.0.0.2:1000"), addr("1.2.3.4:80"), flags::SYN, 1, 0, b"")
        .unwrap();
    harness.inject(syn).await;
    let _ = harness.written().await;
    assert_eq!(harness.engine.sessions().len(), 1);

    harness.engine.close().await;
    harness.engine.close().await;

    assert!(harness.engine.is_closed());
    assert!(harness.engine.sessions().is_empty());
    assert!(harness.device.is_closed());
    assert!(harness.errors.lock().is_empty());

    let listener = harness.engine.listener_addr();
    assert!(tokio::net::TcpStream::connect(listener).await.is_err());
}
