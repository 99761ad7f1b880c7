use bytes::Bytes;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use labwire::{
    //
    packet_type,
    Arbiter,
    ArbiterConfig,
    ArbiterState,
    CorrelationId,
    DeviceIdentity,
    LinkPacket,
    RpcError,
};

fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

async fn arbiter() -> Arbiter {
    // ---
    init_logging();
    let config = ArbiterConfig::default()
        .with_bind_address(localhost())
        .with_port(0)
        .with_sweep_interval(Duration::from_millis(20));
    Arbiter::start(config).await.unwrap()
}

/// A device that never answers.
async fn silent_device() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind((localhost(), 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

/// A device that answers every request with its body reversed.
async fn echo_device() -> SocketAddr {
    // ---
    let socket = UdpSocket::bind((localhost(), 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let Ok(request) = LinkPacket::decode(&buf[..len]) else {
                continue;
            };
            if request.id.is_notification() {
                continue;
            }
            let mut body = request.body.to_vec();
            body.reverse();
            let reply = LinkPacket::response(request.packet_type, request.id, body);
            socket.send_to(&reply.encode().unwrap(), from).await.unwrap();
        }
    });

    addr
}

#[tokio::test]
async fn test_request_gets_matching_response() {
    // ---
    let arbiter = arbiter().await;
    let device = echo_device().await;

    let pending = arbiter
        .request(device, packet_type::REGISTER_READ, vec![1, 2, 3], Duration::from_secs(2))
        .unwrap();
    let id = pending.id();
    assert!(!id.is_notification());

    let reply = pending.await.unwrap();
    assert!(reply.response);
    assert_eq!(reply.id, id);
    assert_eq!(reply.packet_type, packet_type::REGISTER_READ);
    assert_eq!(&reply.body[..], &[3u8, 2, 1]);

    assert_eq!(arbiter.pending_count(), 0);
    assert!(arbiter.is_id_available(id));
}

#[tokio::test]
async fn test_concurrent_requests_are_demultiplexed() {
    // ---
    let arbiter = arbiter().await;
    let device = echo_device().await;

    let pending: Vec<_> = (0..100u8)
        .map(|n| {
            arbiter
                .request(device, packet_type::REGISTER_READ, vec![n, 0xEE], Duration::from_secs(5))
                .unwrap()
        })
        .collect();

    let ids: HashSet<CorrelationId> = pending.iter().map(|p| p.id()).collect();
    assert_eq!(ids.len(), 100);

    let replies = futures::future::join_all(pending).await;
    for (n, reply) in replies.into_iter().enumerate() {
        assert_eq!(&reply.unwrap().body[..], &[0xEE, n as u8]);
    }
    assert_eq!(arbiter.pending_count(), 0);
}

#[tokio::test]
async fn test_ttl_expiry_signals_timeout_and_frees_id() {
    // ---
    let arbiter = arbiter().await;
    let (_device, addr) = silent_device().await;

    let started = Instant::now();
    let pending = arbiter
        .request(addr, packet_type::REGISTER_READ, Bytes::new(), Duration::from_secs(1))
        .unwrap();
    let id = pending.id();
    assert!(!arbiter.is_id_available(id));

    let result = pending.await;
    assert!(matches!(result, Err(RpcError::Timeout)));
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(arbiter.is_id_available(id));
    assert_eq!(arbiter.pending_count(), 0);
}

#[tokio::test]
async fn test_late_response_is_dropped() {
    // ---
    let arbiter = arbiter().await;
    let (device, addr) = silent_device().await;

    let pending = arbiter
        .request(addr, packet_type::REGISTER_READ, vec![7], Duration::from_millis(100))
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, from) = device.recv_from(&mut buf).await.unwrap();
    let request = LinkPacket::decode(&buf[..len]).unwrap();

    assert!(matches!(pending.await, Err(RpcError::Timeout)));

    // Answer after the sweep; nothing may be delivered or leaked
    let late = LinkPacket::response(request.packet_type, request.id, vec![1]);
    device.send_to(&late.encode().unwrap(), from).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(arbiter.pending_count(), 0);
    assert!(arbiter.is_id_available(request.id));
}

#[tokio::test]
async fn test_pool_exhaustion_fails_fast() {
    // ---
    let arbiter = arbiter().await;
    let (_device, addr) = silent_device().await;

    let mut pending = Vec::new();
    for _ in 0..254 {
        pending.push(
            arbiter
                .request(addr, packet_type::REGISTER_READ, Bytes::new(), Duration::from_secs(60))
                .unwrap(),
        );
    }

    let ids: HashSet<u8> = pending.iter().map(|p| p.id().get()).collect();
    assert_eq!(ids.len(), 254);
    assert!(!ids.contains(&0));

    let started = Instant::now();
    let err = arbiter
        .request(addr, packet_type::REGISTER_READ, Bytes::new(), Duration::from_secs(60))
        .unwrap_err();
    assert!(matches!(err, RpcError::IdPoolExhausted));
    assert!(started.elapsed() < Duration::from_millis(100));

    // Notifications need no id and still go out
    arbiter.notify(addr, packet_type::STATE_CHANGE, vec![1]).unwrap();

    arbiter.stop().await;
}

#[tokio::test]
async fn test_unrepresentable_ttl_is_rejected() {
    // ---
    let arbiter = arbiter().await;
    let device = echo_device().await;

    let err = arbiter
        .request(device, packet_type::REGISTER_READ, Bytes::new(), Duration::MAX)
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidState(_)));
    assert_eq!(arbiter.pending_count(), 0);

    // The arbiter keeps serving normal requests
    let reply = arbiter
        .request(device, packet_type::REGISTER_READ, vec![4, 5], Duration::from_secs(2))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(&reply.body[..], &[5u8, 4]);
}

#[tokio::test]
async fn test_error_reply_is_device_error() {
    // ---
    let arbiter = arbiter().await;
    let (device, addr) = silent_device().await;

    let pending = arbiter
        .request(addr, packet_type::REGISTER_WRITE, vec![0x10, 0x01], Duration::from_secs(2))
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, from) = device.recv_from(&mut buf).await.unwrap();
    let request = LinkPacket::decode(&buf[..len]).unwrap();

    let refusal = LinkPacket::response(packet_type::ERROR, request.id, vec![0x42]);
    device.send_to(&refusal.encode().unwrap(), from).await.unwrap();

    match pending.await {
        Err(RpcError::DeviceError(packet)) => {
            assert_eq!(packet.id, request.id);
            assert_eq!(&packet.body[..], &[0x42u8]);
        }
        other => panic!("expected device error, got {other:?}"),
    }
    assert!(arbiter.is_id_available(request.id));
}

#[tokio::test]
async fn test_notification_uses_id_zero() {
    // ---
    let arbiter = arbiter().await;
    let (device, addr) = silent_device().await;

    arbiter.notify(addr, packet_type::STATE_CHANGE, vec![0x01]).unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), device.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let packet = LinkPacket::decode(&buf[..len]).unwrap();

    assert!(packet.id.is_notification());
    assert!(!packet.response);
    assert_eq!(packet.packet_type, packet_type::STATE_CHANGE);
    assert_eq!(arbiter.pending_count(), 0);
}

#[tokio::test]
async fn test_corrupt_datagrams_are_ignored() {
    // ---
    let arbiter = arbiter().await;
    let (device, addr) = silent_device().await;

    let pending = arbiter
        .request(addr, packet_type::REGISTER_WRITE, vec![9], Duration::from_secs(2))
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, from) = device.recv_from(&mut buf).await.unwrap();
    let request = LinkPacket::decode(&buf[..len]).unwrap();

    let mut corrupted = LinkPacket::response(request.packet_type, request.id, vec![0xAA])
        .encode()
        .unwrap()
        .to_vec();
    corrupted[2] ^= 0xFF;
    device.send_to(&corrupted, from).await.unwrap();
    device.send_to(b"not a frame", from).await.unwrap();

    let good = LinkPacket::response(request.packet_type, request.id, vec![0xBB]);
    device.send_to(&good.encode().unwrap(), from).await.unwrap();

    assert_eq!(&pending.await.unwrap().body[..], &[0xBBu8]);
}

#[tokio::test]
async fn test_stop_fails_pending_requests() {
    // ---
    let arbiter = arbiter().await;
    let (_device, addr) = silent_device().await;
    assert_eq!(arbiter.state(), ArbiterState::Running);

    let pending = arbiter
        .request(addr, packet_type::REGISTER_READ, Bytes::new(), Duration::from_secs(60))
        .unwrap();

    arbiter.stop().await;
    assert_eq!(arbiter.state(), ArbiterState::Stopped);
    assert!(matches!(pending.await, Err(RpcError::Shutdown)));

    let err = arbiter
        .request(addr, packet_type::REGISTER_READ, Bytes::new(), Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, RpcError::Shutdown));

    // Stopping twice is harmless
    arbiter.stop().await;
}

#[tokio::test]
async fn test_port_in_use() {
    // ---
    let first = arbiter().await;
    let config = ArbiterConfig::default()
        .with_bind_address(localhost())
        .with_port(first.local_addr().port());

    assert!(matches!(
        Arbiter::start(config).await,
        Err(RpcError::PortInUse(_))
    ));
}

/// Stands in for the broadcast domain: every probe it receives is answered
/// by one device per `(address, identity)` pair.
async fn fake_network(devices: Vec<(Ipv4Addr, &'static str)>) -> SocketAddr {
    // ---
    let socket = UdpSocket::bind((localhost(), 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let Ok(probe) = LinkPacket::decode(&buf[..len]) else {
                continue;
            };
            if probe.packet_type != packet_type::DISCOVERY || probe.response {
                continue;
            }

            for (ip, identity) in &devices {
                let device = UdpSocket::bind((*ip, 0)).await.unwrap();
                let (vendor, model) = identity.split_once(',').unwrap();
                let answer = LinkPacket::discovery_response(vendor, model).encode().unwrap();
                device.send_to(&answer, from).await.unwrap();
            }
        }
    });

    addr
}

async fn discovering_arbiter(network: SocketAddr) -> Arbiter {
    // ---
    init_logging();
    let config = ArbiterConfig::default()
        .with_bind_address(localhost())
        .with_port(0)
        .with_broadcast_address(network.ip())
        .with_device_port(network.port());
    Arbiter::start(config).await.unwrap()
}

#[tokio::test]
async fn test_discovery_collects_responses() {
    // ---
    let network = fake_network(vec![
        (Ipv4Addr::new(127, 0, 0, 5), "Acme,Model1"),
        (Ipv4Addr::new(127, 0, 0, 6), "Acme,Model2"),
    ])
    .await;
    let arbiter = discovering_arbiter(network).await;

    let result = arbiter.discover(Duration::from_millis(300)).await.unwrap();

    let identities = result.identities();
    assert_eq!(identities.len(), 2);
    assert_eq!(
        identities[&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 5))],
        ("Acme".to_string(), "Model1".to_string())
    );
    assert_eq!(
        identities[&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 6))],
        ("Acme".to_string(), "Model2".to_string())
    );
}

#[tokio::test]
async fn test_discovery_entries_are_sticky() {
    // ---
    let first = fake_network(vec![
        (Ipv4Addr::new(127, 0, 0, 5), "Acme,Model1"),
        (Ipv4Addr::new(127, 0, 0, 6), "Acme,Model2"),
    ])
    .await;
    let arbiter = discovering_arbiter(first).await;
    assert_eq!(arbiter.discover(Duration::from_millis(300)).await.unwrap().len(), 2);

    // Only .5 answers the next time, with a new identity
    let device = UdpSocket::bind((Ipv4Addr::new(127, 0, 0, 5), 0)).await.unwrap();
    let answer = LinkPacket::discovery_response("Acme", "Model1B").encode().unwrap();
    device.send_to(&answer, arbiter.local_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = arbiter.devices();
    assert_eq!(result.len(), 2);
    let five = result.get(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 5))).unwrap();
    assert_eq!(five.identity, DeviceIdentity::new("Acme", "Model1B"));
    assert!(result.contains(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 6))));

    arbiter.clear_devices();
    assert!(arbiter.devices().is_empty());
}

#[tokio::test]
async fn test_prune_devices_forgets_stale_entries() {
    // ---
    let arbiter = arbiter().await;
    let stale = Ipv4Addr::new(127, 0, 0, 7);
    let fresh = Ipv4Addr::new(127, 0, 0, 8);

    let answer = LinkPacket::discovery_response("Acme", "Model1").encode().unwrap();
    let device = UdpSocket::bind((stale, 0)).await.unwrap();
    device.send_to(&answer, arbiter.local_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let device = UdpSocket::bind((fresh, 0)).await.unwrap();
    device.send_to(&answer, arbiter.local_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(arbiter.devices().len(), 2);

    let pruned = arbiter.prune_devices(Duration::from_millis(200));
    assert_eq!(pruned, vec![IpAddr::V4(stale)]);

    let remaining = arbiter.devices();
    assert_eq!(remaining.len(), 1);
    assert!(remaining.contains(&IpAddr::V4(fresh)));
}

#[tokio::test]
async fn test_discover_at_probes_one_address() {
    // ---
    init_logging();
    let address = Ipv4Addr::new(127, 0, 0, 9);
    let device = UdpSocket::bind((address, 0)).await.unwrap();
    let device_port = device.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            let Ok(probe) = LinkPacket::decode(&buf[..len]) else {
                continue;
            };
            if probe.packet_type == packet_type::DISCOVERY && !probe.response {
                let answer = LinkPacket::discovery_response("Acme", "Model3").encode().unwrap();
                device.send_to(&answer, from).await.unwrap();
            }
        }
    });

    let config = ArbiterConfig::default()
        .with_bind_address(localhost())
        .with_port(0)
        .with_device_port(device_port)
        .with_sweep_interval(Duration::from_millis(20));
    let arbiter = Arbiter::start(config).await.unwrap();

    let found = arbiter
        .discover_at(IpAddr::V4(address), Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.identity, DeviceIdentity::new("Acme", "Model3"));
    assert!(arbiter.devices().contains(&IpAddr::V4(address)));

    // Nobody listens there
    let missing = arbiter
        .discover_at(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 10)), Duration::from_millis(200))
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_periodic_discovery_runs_without_asking() {
    // ---
    init_logging();
    let network = fake_network(vec![
        (Ipv4Addr::new(127, 0, 0, 5), "Acme,Model1"),
        (Ipv4Addr::new(127, 0, 0, 6), "Acme,Model2"),
    ])
    .await;
    let config = ArbiterConfig::default()
        .with_bind_address(localhost())
        .with_port(0)
        .with_broadcast_address(network.ip())
        .with_device_port(network.port())
        .with_discovery_interval(Some(Duration::from_millis(100)));
    let arbiter = Arbiter::start(config).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(arbiter.devices().len(), 2);

    // Forgotten devices come back on the next round
    arbiter.clear_devices();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(arbiter.devices().len(), 2);

    arbiter.stop().await;
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
