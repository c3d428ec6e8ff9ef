use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use super::clock::Clock;
use super::config::RegistryConfig;
use super::connection::{Connection, ConnectionState};
use super::events::{ConnectionEvent, DisconnectReason, GroupId, PeerId, RegistryEvent};
use super::packet::{MAX_PACKET_SIZE, Packet, PacketType};
use super::socket::DatagramSocket;
use super::stats::{NetworkStats, rand_u16};

const LOG_TARGET: &str = "tether::registry";

type Outgoing = Vec<(SocketAddr, Vec<u8>)>;

/// Result of sending one payload to several peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fanout {
    pub sent: usize,
    /// Ids with no connection behind them.
    pub missing: Vec<PeerId>,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<PeerId, Connection>,
    peers_by_addr: HashMap<SocketAddr, PeerId>,
    groups: HashMap<GroupId, BTreeSet<PeerId>>,
    banned: HashSet<SocketAddr>,
    next_peer_id: u32,
    events: VecDeque<RegistryEvent>,
}

impl RegistryState {
    fn allocate_peer(&mut self) -> PeerId {
        self.next_peer_id += 1;
        PeerId(self.next_peer_id)
    }

    fn insert(&mut self, connection: Connection) {
        self.peers_by_addr.insert(connection.addr(), connection.peer());
        self.connections.insert(connection.peer(), connection);
    }

    fn remove(&mut self, peer: PeerId) -> Option<Connection> {
        let connection = self.connections.remove(&peer)?;
        self.peers_by_addr.remove(&connection.addr());
        self.groups.retain(|_, members| {
            members.remove(&peer);
            !members.is_empty()
        });
        Some(connection)
    }

    /// Moves a connection's outbox and events into the registry. Returns
    /// true when the connection has finished and should be removed.
    fn drain_connection(&mut self, peer: PeerId, outgoing: &mut Outgoing) -> bool {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return false;
        };

        let addr = connection.addr();
        outgoing.extend(connection.take_outbox().into_iter().map(|d| (addr, d)));

        let was_connected = connection.was_connected();
        let finished = connection.is_disconnected();
        for event in connection.take_events() {
            let event = match event {
                ConnectionEvent::Connected => RegistryEvent::Connected { peer, addr },
                ConnectionEvent::Message { payload, reliable } => RegistryEvent::Message {
                    peer,
                    payload,
                    reliable,
                },
                ConnectionEvent::Disconnected(reason) if was_connected => {
                    RegistryEvent::Disconnected { peer, reason }
                }
                ConnectionEvent::Disconnected(reason) => RegistryEvent::ConnectionFailed {
                    peer: Some(peer),
                    addr,
                    reason,
                },
            };
            self.events.push_back(event);
        }
        finished
    }
}

/// Owns every connection on one socket. The connection table sits behind a
/// single mutex shared by the receive thread and the update loop; datagrams
/// are only sent once that lock is released.
pub struct ConnectionRegistry {
    socket: Box<dyn DatagramSocket>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    running: Arc<AtomicBool>,
}

impl ConnectionRegistry {
    pub fn new<S: DatagramSocket + 'static>(
        socket: S,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Self {
        log::info!(
            target: LOG_TARGET,
            "Registry on {} (max {} connections, accepting: {})",
            socket.local_addr(),
            config.max_connections,
            config.accept_incoming
        );
        Self {
            socket: Box::new(socket),
            clock,
            config,
            state: Mutex::new(RegistryState::default()),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts a handshake with `addr`. An existing connection to the same
    /// address is returned as is.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<PeerId> {
        let mut outgoing = Vec::new();
        let peer = {
            let mut state = self.lock();
            if let Some(&peer) = state.peers_by_addr.get(&addr) {
                return Ok(peer);
            }

            let peer = state.allocate_peer();
            let connection = Connection::connect(
                peer,
                addr,
                rand_u16(),
                self.config.connection.clone(),
                self.clock.now(),
            );
            state.insert(connection);
            state.drain_connection(peer, &mut outgoing);
            peer
        };

        self.flush(outgoing)?;
        Ok(peer)
    }

    /// Waits up to the configured receive timeout for one datagram and
    /// dispatches it. Returns whether a datagram arrived.
    pub fn receive_once(&self) -> io::Result<bool> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let Some((len, from)) = self.socket.recv_from(&mut buf, self.config.receive_timeout)? else {
            return Ok(false);
        };

        let packet = match Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!(target: LOG_TARGET, "Dropping {} bytes from {}: {}", len, from, e);
                return Ok(true);
            }
        };

        let mut outgoing = Vec::new();
        {
            let mut state = self.lock();
            let now = self.clock.now();

            if let Some(&peer) = state.peers_by_addr.get(&from) {
                if let Some(connection) = state.connections.get_mut(&peer) {
                    connection.handle_packet(packet, len, now);
                }
                if state.drain_connection(peer, &mut outgoing) {
                    state.remove(peer);
                }
            } else if packet.payload == PacketType::Syn {
                self.accept(&mut state, from, packet.sequence, &mut outgoing);
            } else {
                log::debug!(
                    target: LOG_TARGET,
                    "Dropping {:?} from unknown address {}",
                    packet.header().kind,
                    from
                );
            }
        }

        self.flush(outgoing)?;
        Ok(true)
    }

    fn accept(
        &self,
        state: &mut RegistryState,
        from: SocketAddr,
        syn_sequence: u16,
        outgoing: &mut Outgoing,
    ) {
        if state.banned.contains(&from) {
            log::debug!(target: LOG_TARGET, "Ignoring syn from banned address {}", from);
            return;
        }
        if !self.config.accept_incoming {
            log::debug!(target: LOG_TARGET, "Ignoring syn from {}: not accepting", from);
            return;
        }

        if state.connections.len() >= self.config.max_connections {
            log::warn!(target: LOG_TARGET, "Refusing {}: server full", from);
            match Packet::new(0, PacketType::Close).encode() {
                Ok(datagram) => outgoing.push((from, datagram)),
                Err(e) => log::warn!(target: LOG_TARGET, "Failed to encode close: {}", e),
            }
            state.events.push_back(RegistryEvent::ConnectionFailed {
                peer: None,
                addr: from,
                reason: DisconnectReason::ServerFull,
            });
            return;
        }

        let peer = state.allocate_peer();
        let connection = Connection::accept(
            peer,
            from,
            syn_sequence,
            rand_u16(),
            self.config.connection.clone(),
            self.clock.now(),
        );
        log::info!(target: LOG_TARGET, "{} handshaking from {}", peer, from);
        state.insert(connection);
        state.drain_connection(peer, outgoing);
    }

    /// Runs [`receive_once`](Self::receive_once) on a dedicated thread until
    /// [`stop`](Self::stop). Needs a receive timeout to notice the stop.
    pub fn spawn_receiver(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let registry = Arc::clone(self);
        thread::Builder::new()
            .name("tether-receive".into())
            .spawn(move || {
                while registry.is_running() {
                    if let Err(e) = registry.receive_once() {
                        log::warn!(target: LOG_TARGET, "Receive failed: {}", e);
                        thread::sleep(registry.config.receive_timeout.unwrap_or_default());
                    }
                }
                log::debug!(target: LOG_TARGET, "Receive thread exiting");
            })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Polls every connection, flushes their datagrams and reaps the ones
    /// that finished.
    pub fn update(&self) -> io::Result<()> {
        let mut outgoing = Vec::new();
        {
            let mut state = self.lock();
            let now = self.clock.now();

            for connection in state.connections.values_mut() {
                connection.update(now);
            }

            let peers: Vec<PeerId> = state.connections.keys().copied().collect();
            let finished: Vec<PeerId> = peers
                .into_iter()
                .filter(|&peer| state.drain_connection(peer, &mut outgoing))
                .collect();

            for peer in finished {
                state.remove(peer);
                log::debug!(target: LOG_TARGET, "Removed {}", peer);
            }
        }

        self.flush(outgoing)
    }

    pub fn send(&self, peer: PeerId, payload: &[u8], reliable: bool) -> bool {
        let fanout = self.send_many([peer], payload, reliable);
        fanout.sent == 1
    }

    /// Sends `payload` to each peer under one lock acquisition.
    pub fn send_many<I>(&self, peers: I, payload: &[u8], reliable: bool) -> Fanout
    where
        I: IntoIterator<Item = PeerId>,
    {
        let mut fanout = Fanout::default();
        let mut outgoing = Vec::new();
        {
            let mut state = self.lock();
            let now = self.clock.now();

            for peer in peers {
                let Some(connection) = state.connections.get_mut(&peer) else {
                    fanout.missing.push(peer);
                    continue;
                };
                let sent = if reliable {
                    connection.send_reliable(payload, now)
                } else {
                    connection.send_unreliable(payload, now)
                };
                if sent {
                    fanout.sent += 1;
                }
                let addr = connection.addr();
                outgoing.extend(connection.take_outbox().into_iter().map(|d| (addr, d)));
            }
        }

        if let Err(e) = self.flush(outgoing) {
            log::warn!(target: LOG_TARGET, "Send failed: {}", e);
        }
        fanout
    }

    /// Snapshot of every known peer, in id order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let state = self.lock();
        let mut peers: Vec<PeerId> = state.connections.keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let state = self.lock();
        let mut peers: Vec<PeerId> = state
            .connections
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.peer())
            .collect();
        peers.sort();
        peers
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.lock().connections.contains_key(&peer)
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.lock().connections.get(&peer).map(|c| c.addr())
    }

    pub fn peer_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.lock().peers_by_addr.get(&addr).copied()
    }

    pub fn state(&self, peer: PeerId) -> Option<ConnectionState> {
        self.lock().connections.get(&peer).map(|c| c.state())
    }

    pub fn stats(&self, peer: PeerId) -> Option<NetworkStats> {
        self.lock().connections.get(&peer).map(|c| c.stats().clone())
    }

    pub fn connected_count(&self) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn drain_events(&self) -> Vec<RegistryEvent> {
        self.lock().events.drain(..).collect()
    }

    pub fn join_group(&self, peer: PeerId, group: GroupId) -> bool {
        let mut state = self.lock();
        if !state.connections.contains_key(&peer) {
            return false;
        }
        state.groups.entry(group).or_default().insert(peer);
        true
    }

    pub fn leave_group(&self, peer: PeerId, group: GroupId) -> bool {
        let mut state = self.lock();
        let Some(members) = state.groups.get_mut(&group) else {
            return false;
        };
        let removed = members.remove(&peer);
        if members.is_empty() {
            state.groups.remove(&group);
        }
        removed
    }

    pub fn peers_in_group(&self, group: GroupId) -> Vec<PeerId> {
        self.lock()
            .groups
            .get(&group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Graceful close: pending reliable sends are flushed first.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        self.with_connection(peer, |connection, now| connection.disconnect(now))
    }

    pub fn kick(&self, peer: PeerId) -> bool {
        self.with_connection(peer, |connection, now| {
            connection.close(DisconnectReason::Kicked, now)
        })
    }

    /// Sends a Ban and refuses later handshakes from the peer's address.
    pub fn ban(&self, peer: PeerId) -> bool {
        if let Some(addr) = self.peer_addr(peer) {
            self.lock().banned.insert(addr);
            log::info!(target: LOG_TARGET, "Banned {} ({})", peer, addr);
        }
        self.with_connection(peer, |connection, now| connection.ban(now))
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        self.lock().banned.contains(&addr)
    }

    /// Closes every connection and stops the receive thread.
    pub fn shutdown(&self) -> io::Result<()> {
        let mut outgoing = Vec::new();
        {
            let mut state = self.lock();
            let now = self.clock.now();
            let peers: Vec<PeerId> = state.connections.keys().copied().collect();
            for &peer in &peers {
                if let Some(connection) = state.connections.get_mut(&peer) {
                    connection.close(DisconnectReason::Graceful, now);
                }
                state.drain_connection(peer, &mut outgoing);
            }
            for peer in peers {
                state.remove(peer);
            }
        }
        log::info!(target: LOG_TARGET, "Registry on {} shut down", self.local_addr());
        self.stop();
        self.flush(outgoing)
    }

    fn with_connection<F>(&self, peer: PeerId, f: F) -> bool
    where
        F: FnOnce(&mut Connection, std::time::Instant),
    {
        let mut outgoing = Vec::new();
        {
            let mut state = self.lock();
            let now = self.clock.now();
            let Some(connection) = state.connections.get_mut(&peer) else {
                return false;
            };
            f(connection, now);
            if state.drain_connection(peer, &mut outgoing) {
                state.remove(peer);
            }
        }
        if let Err(e) = self.flush(outgoing) {
            log::warn!(target: LOG_TARGET, "Send to {} failed: {}", peer, e);
        }
        true
    }

    /// Sends everything, returning the first failure.
    fn flush(&self, outgoing: Outgoing) -> io::Result<()> {
        let mut result = Ok(());
        for (addr, datagram) in outgoing {
            if let Err(e) = self.socket.send_to(&datagram, addr) {
                log::warn!(target: LOG_TARGET, "Send to {} failed: {}", addr, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::clock::ManualClock;
    use crate::net::socket::MemoryNetwork;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn config(accept: bool, max: usize) -> RegistryConfig {
        RegistryConfig {
            max_connections: max,
            accept_incoming: accept,
            receive_timeout: Some(Duration::from_millis(2)),
            ..Default::default()
        }
    }

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

    #[test]
    fn test_server_full_refuses() {
        let network = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new());
        let server = ConnectionRegistry::new(network.bind(addr(1)).unwrap(), clock.clone(), config(true, 1));
        let first = ConnectionRegistry::new(network.bind(addr(2)).unwrap(), clock.clone(), config(false, 1));
        let second = ConnectionRegistry::new(network.bind(addr(3)).unwrap(), clock.clone(), config(false, 1));

        first.connect(addr(1)).unwrap();
        pump(&[&server, &first]);
        assert_eq!(server.connected_count(), 1);

        let refused = second.connect(addr(1)).unwrap();
        pump(&[&server, &second]);

        assert!(server.drain_events().contains(&RegistryEvent::ConnectionFailed {
            peer: None,
            addr: addr(3),
            reason: DisconnectReason::ServerFull,
        }));
        assert!(second.drain_events().contains(&RegistryEvent::ConnectionFailed {
            peer: Some(refused),
            addr: addr(1),
            reason: DisconnectReason::Closed,
        }));
        assert!(!second.contains(refused));
    }

    #[test]
    fn client_role_ignores_syn() {
        let network = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new());
        let a = ConnectionRegistry::new(network.bind(addr(1)).unwrap(), clock.clone(), config(false, 4));
        let b = ConnectionRegistry::new(network.bind(addr(2)).unwrap(), clock.clone(), config(false, 4));

        b.connect(addr(1)).unwrap();
        pump(&[&a, &b]);
        assert_eq!(a.total_count(), 0);
        assert_eq!(b.state(PeerId(1)), Some(ConnectionState::Connecting));
    }

    #[test]
    fn malformed_and_unknown_datagrams_dropped() {
        let network = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new());
        let server = ConnectionRegistry::new(network.bind(addr(1)).unwrap(), clock, config(true, 4));
        let raw = network.bind(addr(9)).unwrap();

        raw.send_to(&[42, 0], addr(1)).unwrap();
        raw.send_to(&Packet::new(3, PacketType::Alive).encode().unwrap(), addr(1)).unwrap();
        pump(&[&server]);

        assert_eq!(server.total_count(), 0);
        assert!(server.drain_events().is_empty());
    }

    #[test]
    fn ban_blocks_reconnect() {
        let network = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new());
        let server = ConnectionRegistry::new(network.bind(addr(1)).unwrap(), clock.clone(), config(true, 4));
        let client = ConnectionRegistry::new(network.bind(addr(2)).unwrap(), clock.clone(), config(false, 4));

        client.connect(addr(1)).unwrap();
        pump(&[&server, &client]);
        let peer = server.peer_ids()[0];
        server.drain_events();

        assert!(server.ban(peer));
        pump(&[&client]);
        assert!(client.drain_events().iter().any(|e| matches!(
            e,
            RegistryEvent::Disconnected {
                reason: DisconnectReason::Banned,
                ..
            }
        )));
        assert!(server.is_banned(addr(2)));

        client.connect(addr(1)).unwrap();
        pump(&[&server, &client]);
        assert_eq!(server.total_count(), 0);
    }

    #[test]
    fn groups_follow_membership() {
        let network = MemoryNetwork::new();
        let clock = Arc::new(ManualClock::new());
        let server = ConnectionRegistry::new(network.bind(addr(1)).unwrap(), clock.clone(), config(true, 4));
        let client = ConnectionRegistry::new(network.bind(addr(2)).unwrap(), clock.clone(), config(false, 4));

        client.connect(addr(1)).unwrap();
        pump(&[&server, &client]);
        let peer = server.peer_ids()[0];

        assert!(server.join_group(peer, GroupId(3)));
        assert!(!server.join_group(PeerId(99), GroupId(3)));
        assert_eq!(server.peers_in_group(GroupId(3)), vec![peer]);

        assert!(server.kick(peer));
        assert!(server.peers_in_group(GroupId(3)).is_empty());
        assert!(!server.contains(peer));
    }
}
