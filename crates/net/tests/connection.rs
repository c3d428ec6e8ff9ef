use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tether::{
    Connection, ConnectionConfig, ConnectionRegistry, ConnectionState, DatagramSocket,
    DisconnectReason, ManualClock, MemoryNetwork, OutgoingMessage, Packet, PacketType, PeerId,
    RecipientFilter, RegistryConfig, RegistryEvent, SystemClock, UdpTransport,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn local(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn memory_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 1, 0, 1], port))
}

fn quick(mut config: RegistryConfig) -> RegistryConfig {
    config.receive_timeout = Some(Duration::from_millis(2));
    config
}

/// Receives on every registry until the network goes quiet.
fn pump(registries: &[&ConnectionRegistry]) {
    loop {
        let mut any = false;
        for registry in registries {
            while registry.receive_once().unwrap() {
                any = true;
            }
        }
        if !any {
            break;
        }
    }
}

struct MemoryPair {
    network: MemoryNetwork,
    clock: Arc<ManualClock>,
    server: ConnectionRegistry,
    client: ConnectionRegistry,
    server_addr: SocketAddr,
    peer_on_client: PeerId,
}

fn connected_pair() -> MemoryPair {
    let network = MemoryNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let server_addr = memory_addr(1);

    let server = ConnectionRegistry::new(
        network.bind(server_addr).unwrap(),
        clock.clone(),
        quick(RegistryConfig::server(8)),
    );
    let client = ConnectionRegistry::new(
        network.bind(memory_addr(2)).unwrap(),
        clock.clone(),
        quick(RegistryConfig::client()),
    );

    let peer_on_client = client.connect(server_addr).unwrap();
    pump(&[&server, &client]);
    assert_eq!(client.state(peer_on_client), Some(ConnectionState::Connected));
    assert_eq!(server.connected_count(), 1);
    server.drain_events();
    client.drain_events();

    MemoryPair {
        network,
        clock,
        server,
        client,
        server_addr,
        peer_on_client,
    }
}

fn messages(events: &[RegistryEvent]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            RegistryEvent::Message { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_handshake_from_syn_1000_over_udp() {
    let port = next_port();
    let server = ConnectionRegistry::new(
        UdpTransport::bind(local(port)).unwrap(),
        Arc::new(SystemClock),
        quick(RegistryConfig::server(4)),
    );
    let client_socket = UdpTransport::bind(local(port + 1)).unwrap();

    let now = Instant::now();
    let mut client = Connection::connect(
        PeerId(1),
        local(port),
        1000,
        ConnectionConfig::default(),
        now,
    );
    let syn = Packet::decode(&client.take_outbox()[0]).unwrap();
    assert_eq!(syn, Packet::new(1000, PacketType::Syn));
    client_socket
        .send_to(&syn.encode().unwrap(), local(port))
        .unwrap();

    let start = Instant::now();
    let mut buf = [0u8; 1200];
    while start.elapsed() < Duration::from_millis(500) && !client.is_connected() {
        server.receive_once().unwrap();
        if let Some((len, _)) = client_socket
            .recv_from(&mut buf, Some(Duration::from_millis(5)))
            .unwrap()
        {
            let packet = Packet::decode(&buf[..len]).unwrap();
            assert_eq!(
                packet.payload,
                PacketType::SynAck { syn_sequence: 1000 }
            );
            client.handle_packet(packet, len, Instant::now());
        }
    }
    assert!(client.is_connected(), "no syn-ack within 500ms");

    for datagram in client.take_outbox() {
        client_socket.send_to(&datagram, local(port)).unwrap();
    }
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(500) && server.connected_count() == 0 {
        server.receive_once().unwrap();
    }

    assert_eq!(server.connected_count(), 1);
    let events = server.drain_events();
    assert!(matches!(
        events.as_slice(),
        [RegistryEvent::Connected { addr, .. }] if *addr == local(port + 1)
    ));
}

#[test]
fn test_registries_over_udp_with_receive_threads() {
    let port = next_port();
    let server = Arc::new(ConnectionRegistry::new(
        UdpTransport::bind(local(port)).unwrap(),
        Arc::new(SystemClock),
        quick(RegistryConfig::server(4)),
    ));
    let client = Arc::new(ConnectionRegistry::new(
        UdpTransport::bind(local(port + 1)).unwrap(),
        Arc::new(SystemClock),
        quick(RegistryConfig::client()),
    ));
    let server_thread = server.spawn_receiver().unwrap();
    let client_thread = client.spawn_receiver().unwrap();

    let peer = client.connect(local(port)).unwrap();
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) && client.connected_count() == 0 {
        client.update().unwrap();
        server.update().unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(client.state(peer), Some(ConnectionState::Connected));

    assert!(client.send(peer, b"over the wire", true));

    let mut received = Vec::new();
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) && received.is_empty() {
        server.update().unwrap();
        client.update().unwrap();
        received.extend(messages(&server.drain_events()));
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(received, vec![b"over the wire".to_vec()]);

    client.shutdown().unwrap();
    server.shutdown().unwrap();
    client_thread.join().unwrap();
    server_thread.join().unwrap();
}

#[test]
fn test_reliable_send_survives_dropped_datagram() {
    let pair = connected_pair();

    pair.network.drop_next(pair.server_addr, 1);
    assert!(pair.client.send(pair.peer_on_client, b"retry me", true));
    pump(&[&pair.server, &pair.client]);
    assert!(messages(&pair.server.drain_events()).is_empty());

    pair.clock.advance(RegistryConfig::default().connection.retry_interval);
    pair.client.update().unwrap();
    pump(&[&pair.server, &pair.client]);

    assert_eq!(messages(&pair.server.drain_events()), vec![b"retry me".to_vec()]);
    let stats = pair.client.stats(pair.peer_on_client).unwrap();
    assert_eq!(stats.retransmissions, 1);
}

#[test]
fn test_duplicate_datagram_delivered_once() {
    let pair = connected_pair();

    pair.network.duplicate_next(pair.server_addr, 1);
    pair.client.send(pair.peer_on_client, b"once", true);
    pump(&[&pair.server, &pair.client]);

    assert_eq!(messages(&pair.server.drain_events()), vec![b"once".to_vec()]);
    let server_peer = pair.server.peer_ids()[0];
    let stats = pair.server.stats(server_peer).unwrap();
    assert_eq!(stats.duplicates_dropped, 1);
}

#[test]
fn test_unreliable_send_not_retried() {
    let pair = connected_pair();

    pair.network.drop_next(pair.server_addr, 1);
    pair.client.send(pair.peer_on_client, b"gone", false);
    pair.clock.advance(Duration::from_millis(500));
    pair.client.update().unwrap();
    pump(&[&pair.server, &pair.client]);

    assert!(messages(&pair.server.drain_events()).is_empty());
}

#[test]
fn test_handshake_timeout_reports_failure() {
    let network = MemoryNetwork::new();
    let clock = Arc::new(ManualClock::new());
    let client = ConnectionRegistry::new(
        network.bind(memory_addr(2)).unwrap(),
        clock.clone(),
        quick(RegistryConfig::client()),
    );

    let nowhere = memory_addr(99);
    let peer = client.connect(nowhere).unwrap();
    clock.advance(ConnectionConfig::default().handshake_timeout);
    client.update().unwrap();

    assert_eq!(
        client.drain_events(),
        vec![RegistryEvent::ConnectionFailed {
            peer: Some(peer),
            addr: nowhere,
            reason: DisconnectReason::HandshakeTimeout,
        }]
    );
    assert!(!client.contains(peer));
}

#[test]
fn test_retry_limit_disconnects() {
    let pair = connected_pair();
    let MemoryPair {
        server,
        client,
        clock,
        peer_on_client,
        ..
    } = pair;
    drop(server);

    let config = ConnectionConfig::default();
    client.send(peer_on_client, b"into the void", true);
    for _ in 0..=config.max_retries {
        clock.advance(config.retry_interval);
        client.update().unwrap();
    }

    assert_eq!(
        client.drain_events(),
        vec![RegistryEvent::Disconnected {
            peer: peer_on_client,
            reason: DisconnectReason::RetryLimit,
        }]
    );
    assert_eq!(client.total_count(), 0);
}

#[test]
fn test_idle_timeout() {
    let pair = connected_pair();
    let server_peer = pair.server.peer_ids()[0];

    pair.clock.advance(ConnectionConfig::default().idle_timeout);
    pair.server.update().unwrap();

    assert_eq!(
        pair.server.drain_events(),
        vec![RegistryEvent::Disconnected {
            peer: server_peer,
            reason: DisconnectReason::Timeout,
        }]
    );
}

#[test]
fn test_keepalive_holds_connection_open() {
    let pair = connected_pair();
    let keepalive = ConnectionConfig::default().keepalive_interval;

    for _ in 0..15 {
        pair.clock.advance(keepalive);
        pair.client.update().unwrap();
        pair.server.update().unwrap();
        pump(&[&pair.server, &pair.client]);
    }

    assert_eq!(pair.server.connected_count(), 1);
    assert_eq!(pair.client.connected_count(), 1);
}

#[test]
fn test_graceful_disconnect_reaches_peer() {
    let pair = connected_pair();

    pair.client.send(pair.peer_on_client, b"bye", true);
    assert!(pair.client.disconnect(pair.peer_on_client));
    pump(&[&pair.server, &pair.client]);
    pair.client.update().unwrap();
    pump(&[&pair.server, &pair.client]);

    let events = pair.server.drain_events();
    assert_eq!(messages(&events), vec![b"bye".to_vec()]);
    assert!(events.iter().any(|e| matches!(
        e,
        RegistryEvent::Disconnected {
            reason: DisconnectReason::Closed,
            ..
        }
    )));
    assert_eq!(pair.client.total_count(), 0);
}

#[test]
fn test_filter_prunes_stale_recipients() {
    let pair = connected_pair();
    let second = ConnectionRegistry::new(
        pair.network.bind(memory_addr(3)).unwrap(),
        pair.clock.clone(),
        quick(RegistryConfig::client()),
    );
    second.connect(pair.server_addr).unwrap();
    pump(&[&pair.server, &second]);

    let mut filter = RecipientFilter::all(&pair.server);
    assert_eq!(filter.len(), 2);

    let departed = pair.server.peer_by_addr(memory_addr(3)).unwrap();
    pair.server.kick(departed);

    let mut chat = OutgoingMessage::user("Chat");
    chat.write_string("still here?");
    assert_eq!(chat.send(&mut filter, &pair.server), 1);
    assert_eq!(filter.len(), 1);
    assert!(!filter.contains(departed));

    pump(&[&pair.server, &pair.client, &second]);
    assert_eq!(messages(&pair.client.drain_events()), vec![chat.bytes().to_vec()]);
}
