#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end coordinator tests: a peer cache queries us over loopback.

use icp_protocol::utils::rate_limit::{RateSpec, WindowRateLimiter};
use icp_protocol::utils::watchdog::Heartbeat;
use icp_protocol::{
    Collaborators, IcpCoordinator, IcpError, IcpSection, Message, Opcode, PortRegistry,
    QueryBuilder, ResourceManager, WireCodec,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Fixture {
    coordinator: IcpCoordinator,
    ports: Arc<PortRegistry>,
    rate_limiter: Arc<WindowRateLimiter>,
}

fn fixture(allow_loopback: bool) -> Fixture {
    let ports = Arc::new(PortRegistry::new());
    let rate_limiter = Arc::new(WindowRateLimiter::unlimited());
    let coordinator = IcpCoordinator::new(Collaborators {
        authorizer: Arc::new(move |ip: IpAddr| allow_loopback && ip.is_loopback()),
        cache: Arc::new(|url: &str| url.starts_with("http://cached/")),
        resources: ports.clone(),
        rate_limiter: rate_limiter.clone(),
        watchdog: Arc::new(Heartbeat::new()),
    });
    Fixture {
        coordinator,
        ports,
        rate_limiter,
    }
}

fn config() -> IcpSection {
    IcpSection {
        enabled: true,
        port: 0,
        bind_address: "127.0.0.1".to_string(),
        rate_limit: "unlimited".to_string(),
        watchdog_interval: Duration::from_millis(200),
        ..IcpSection::default()
    }
}

async fn ask(addr: SocketAddr, url: &str) -> Message {
    let client = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
    let query = QueryBuilder::starting_at(41).query(Ipv4Addr::LOCALHOST, url);
    client
        .send_to(&WireCodec::new().encode(&query).unwrap(), addr)
        .await
        .unwrap();

    let mut buf = [0u8; 1500];
    let (len, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("coordinator answers")
        .unwrap();
    assert_eq!(from, addr);
    let response = WireCodec::new().decode(&buf[..len]).unwrap();
    assert_eq!(response.request_number(), 41);
    assert_eq!(response.payload_url(), url);
    assert_eq!(response.length(), query.length() - 4);
    response
}

#[tokio::test]
async fn test_answers_hit_and_miss_no_fetch() {
    let f = fixture(true);
    f.coordinator.start(config()).await.unwrap();
    let addr = f.coordinator.local_addr().await.expect("bound");

    assert_eq!(ask(addr, "http://cached/a").await.opcode(), Opcode::Hit);
    assert_eq!(ask(addr, "http://elsewhere/b").await.opcode(), Opcode::MissNoFetch);

    let snapshot = f.coordinator.metrics().snapshot();
    assert_eq!(snapshot.queries, 2);
    assert_eq!(snapshot.hits, 1);
    assert_eq!(snapshot.misses, 1);

    f.coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn test_unauthorized_peer_is_denied() {
    let f = fixture(false);
    f.coordinator.start(config()).await.unwrap();
    let addr = f.coordinator.local_addr().await.unwrap();

    assert_eq!(ask(addr, "http://cached/a").await.opcode(), Opcode::Denied);
    assert_eq!(f.coordinator.metrics().snapshot().denied, 1);

    f.coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn test_rate_limited_query_gets_no_answer() {
    let f = fixture(true);
    f.coordinator
        .start(IcpSection {
            rate_limit: "1/1h".to_string(),
            ..config()
        })
        .await
        .unwrap();
    let addr = f.coordinator.local_addr().await.unwrap();
    assert_eq!(ask(addr, "http://cached/a").await.opcode(), Opcode::Hit);

    let client = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
    let query = QueryBuilder::new().query(Ipv4Addr::LOCALHOST, "http://cached/a");
    client
        .send_to(&WireCodec::new().encode(&query).unwrap(), addr)
        .await
        .unwrap();
    let mut buf = [0u8; 1500];
    let waited =
        tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(waited.is_err(), "rate-limited query was answered");
    assert_eq!(f.coordinator.metrics().snapshot().rate_limited, 1);

    f.coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn test_fails_closed_when_port_is_taken() {
    let f = fixture(true);
    assert!(f.ports.reserve_udp_port(0, "someone else"));

    let err = f.coordinator.start(config()).await.unwrap_err();
    assert!(matches!(err, IcpError::PortUnavailable(0)));
    assert!(!f.coordinator.is_running().await);
    assert!(f.coordinator.local_addr().await.is_none());
}

#[tokio::test]
async fn test_bind_failure_releases_reservation() {
    let f = fixture(true);
    let taken = std::net::UdpSocket::bind((LOOPBACK, 0)).unwrap();
    let port = taken.local_addr().unwrap().port();

    let err = f
        .coordinator
        .start(IcpSection {
            port,
            ..config()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, IcpError::Io(_)));
    assert!(!f.ports.is_reserved(port));
}

#[tokio::test]
async fn test_stop_releases_port_and_is_idempotent() {
    let f = fixture(true);
    f.coordinator.start(config()).await.unwrap();
    assert!(f.ports.is_reserved(0));
    assert!(f.coordinator.is_running().await);
    assert!(matches!(
        f.coordinator.start(config()).await,
        Err(IcpError::AlreadyRunning)
    ));

    f.coordinator.stop().await.unwrap();
    assert!(!f.ports.is_reserved(0));
    assert!(!f.coordinator.is_running().await);
    f.coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn test_disabled_config_does_not_bind() {
    let f = fixture(true);
    f.coordinator
        .start(IcpSection {
            enabled: false,
            ..config()
        })
        .await
        .unwrap();
    assert!(!f.coordinator.is_running().await);
    assert!(!f.ports.is_reserved(0));
}

#[tokio::test]
async fn test_apply_config_toggles_and_retunes() {
    let f = fixture(true);
    f.coordinator
        .apply_config(IcpSection {
            enabled: false,
            ..config()
        })
        .await
        .unwrap();
    assert!(!f.coordinator.is_running().await);

    f.coordinator.apply_config(config()).await.unwrap();
    assert!(f.coordinator.is_running().await);
    let addr = f.coordinator.local_addr().await.unwrap();

    // Rate limit only: same socket.
    f.coordinator
        .apply_config(IcpSection {
            rate_limit: "10/1s".to_string(),
            ..config()
        })
        .await
        .unwrap();
    assert_eq!(f.coordinator.local_addr().await, Some(addr));
    assert_eq!(
        f.rate_limiter.spec().unwrap(),
        "10/1s".parse::<RateSpec>().unwrap()
    );

    f.coordinator
        .apply_config(IcpSection {
            enabled: false,
            ..config()
        })
        .await
        .unwrap();
    assert!(!f.coordinator.is_running().await);
    assert!(!f.ports.is_reserved(0));
}

#[tokio::test]
async fn test_invalid_rate_limit_is_rejected_before_binding() {
    let f = fixture(true);
    let err = f
        .coordinator
        .start(IcpSection {
            rate_limit: "often".to_string(),
            ..config()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, IcpError::InvalidRateLimit(_)));
    assert!(!f.ports.is_reserved(0));
}

#[tokio::test]
async fn test_send_query_reaches_peer() {
    let f = fixture(true);
    assert!(matches!(
        f.coordinator
            .send_query("http://x/", LOOPBACK, Some(9), false)
            .await,
        Err(IcpError::NotRunning)
    ));

    f.coordinator.start(config()).await.unwrap();
    let peer = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();

    let reqnum = f
        .coordinator
        .send_query("http://x/", LOOPBACK, Some(peer_port), true)
        .await
        .unwrap();

    let mut buf = [0u8; 1500];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let query = WireCodec::new().decode(&buf[..len]).unwrap();
    assert_eq!(query.opcode(), Opcode::Query);
    assert_eq!(query.request_number(), reqnum);
    assert!(query.requests_src_rtt());
    assert_eq!(query.requester(), Some(Ipv4Addr::LOCALHOST));

    f.coordinator.stop().await.unwrap();
}
