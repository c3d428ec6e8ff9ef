use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use super::config::ConnectionConfig;
use super::events::{ConnectionEvent, DisconnectReason, PeerId};
use super::packet::{Packet, PacketType};
use super::sequence::{SequenceTracker, sequence_greater_than};
use super::stats::NetworkStats;

const LOG_TARGET: &str = "tether::connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Dialed out with a Syn.
    Client,
    /// Created from a received Syn.
    Server,
}

#[derive(Debug, Clone)]
pub struct PendingReliable {
    pub sequence: u16,
    datagram: Vec<u8>,
    last_sent: Instant,
    retries: u32,
}

/// Per-peer protocol state. Never touches a socket: outbound datagrams
/// collect in an outbox the owner flushes, and time only advances through
/// the `now` passed to each call.
#[derive(Debug)]
pub struct Connection {
    peer: PeerId,
    addr: SocketAddr,
    side: Side,
    state: ConnectionState,
    config: ConnectionConfig,
    next_sequence: u16,
    handshake_sequence: u16,
    peer_handshake_sequence: u16,
    received: SequenceTracker,
    pending: VecDeque<PendingReliable>,
    created_at: Instant,
    handshake_sent_at: Instant,
    last_receive: Instant,
    last_send: Instant,
    was_connected: bool,
    outbox: Vec<Vec<u8>>,
    events: VecDeque<ConnectionEvent>,
    stats: NetworkStats,
}

impl Connection {
    pub fn connect(
        peer: PeerId,
        addr: SocketAddr,
        initial_sequence: u16,
        config: ConnectionConfig,
        now: Instant,
    ) -> Self {
        let mut connection = Self::new(peer, addr, Side::Client, initial_sequence, config, now);
        log::debug!(target: LOG_TARGET, "{} connecting to {} (syn {})", peer, addr, initial_sequence);
        connection.send_handshake(now);
        connection
    }

    pub fn accept(
        peer: PeerId,
        addr: SocketAddr,
        syn_sequence: u16,
        initial_sequence: u16,
        config: ConnectionConfig,
        now: Instant,
    ) -> Self {
        let mut connection = Self::new(peer, addr, Side::Server, initial_sequence, config, now);
        connection.received.accept(syn_sequence);
        connection.peer_handshake_sequence = syn_sequence;
        connection.last_receive = now;
        log::debug!(target: LOG_TARGET, "{} accepted syn {} from {}", peer, syn_sequence, addr);
        connection.send_handshake(now);
        connection
    }

    fn new(
        peer: PeerId,
        addr: SocketAddr,
        side: Side,
        initial_sequence: u16,
        config: ConnectionConfig,
        now: Instant,
    ) -> Self {
        Self {
            peer,
            addr,
            side,
            state: ConnectionState::Connecting,
            config,
            next_sequence: initial_sequence.wrapping_add(1),
            handshake_sequence: initial_sequence,
            peer_handshake_sequence: 0,
            received: SequenceTracker::new(),
            pending: VecDeque::new(),
            created_at: now,
            handshake_sent_at: now,
            last_receive: now,
            last_send: now,
            was_connected: false,
            outbox: Vec::new(),
            events: VecDeque::new(),
            stats: NetworkStats::default(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    pub fn was_connected(&self) -> bool {
        self.was_connected
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn pending_reliable(&self) -> usize {
        self.pending.len()
    }

    pub fn last_receive_time(&self) -> Instant {
        self.last_receive
    }

    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        self.events.drain(..).collect()
    }

    pub fn send_reliable(&mut self, payload: &[u8], now: Instant) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        if self.pending.len() >= self.config.max_pending_reliable {
            log::warn!(
                target: LOG_TARGET,
                "{} reliable queue full ({} pending), dropping send",
                self.peer,
                self.pending.len()
            );
            return false;
        }

        let sequence = self.next_sequence;
        let packet = Packet::new(sequence, PacketType::Reliable(payload.to_vec()));
        let datagram = match packet.encode() {
            Ok(datagram) => datagram,
            Err(e) => {
                log::warn!(target: LOG_TARGET, "{} reliable send failed: {}", self.peer, e);
                return false;
            }
        };
        self.next_sequence = sequence.wrapping_add(1);

        self.pending.push_back(PendingReliable {
            sequence,
            datagram: datagram.clone(),
            last_sent: now,
            retries: 0,
        });
        self.transmit(datagram, now);
        true
    }

    pub fn send_unreliable(&mut self, payload: &[u8], now: Instant) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let sequence = self.take_sequence();
        self.send_packet(Packet::new(sequence, PacketType::Unreliable(payload.to_vec())), now)
    }

    pub fn handle_packet(&mut self, packet: Packet, size: usize, now: Instant) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        self.stats.record_received(size);
        self.last_receive = now;
        let sequence = packet.sequence;

        match packet.payload {
            PacketType::Syn => self.on_syn(sequence, now),
            PacketType::SynAck { syn_sequence } => self.on_syn_ack(sequence, syn_sequence, now),
            PacketType::Ack { bitfield } => self.on_ack(sequence, bitfield, now),
            PacketType::Alive => {
                if self.is_established() && !self.received.accept(sequence) {
                    self.drop_duplicate(sequence, "alive");
                }
            }
            PacketType::Unreliable(payload) => {
                if !self.is_established() {
                    self.drop_early(sequence);
                } else if self.received.accept(sequence) {
                    self.events.push_back(ConnectionEvent::Message {
                        payload,
                        reliable: false,
                    });
                } else {
                    self.drop_duplicate(sequence, "unreliable");
                }
            }
            PacketType::Reliable(payload) => {
                if !self.is_established() {
                    self.drop_early(sequence);
                    return;
                }
                let accepted = self.received.accept(sequence);
                // duplicates are acked again: the first ack may be the one that was lost
                let bitfield = self.received.ack_bitfield(sequence);
                self.send_packet(Packet::new(sequence, PacketType::Ack { bitfield }), now);
                if accepted {
                    self.events.push_back(ConnectionEvent::Message {
                        payload,
                        reliable: true,
                    });
                } else {
                    self.drop_duplicate(sequence, "reliable");
                }
            }
            PacketType::Close => {
                log::info!(target: LOG_TARGET, "{} closed by peer", self.peer);
                self.terminate(DisconnectReason::Closed);
            }
            PacketType::Ban => {
                log::info!(target: LOG_TARGET, "{} banned by peer", self.peer);
                self.terminate(DisconnectReason::Banned);
            }
        }
    }

    /// Drives handshake retries, retransmission, keep-alive and timeouts.
    pub fn update(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting => {
                if now.saturating_duration_since(self.created_at) >= self.config.handshake_timeout {
                    log::info!(target: LOG_TARGET, "{} handshake with {} timed out", self.peer, self.addr);
                    self.terminate(DisconnectReason::HandshakeTimeout);
                } else if now.saturating_duration_since(self.handshake_sent_at)
                    >= self.config.retry_interval
                {
                    self.send_handshake(now);
                }
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                if now.saturating_duration_since(self.last_receive) >= self.config.idle_timeout {
                    log::info!(target: LOG_TARGET, "{} timed out", self.peer);
                    self.terminate(DisconnectReason::Timeout);
                    return;
                }

                if !self.retransmit(now) {
                    log::info!(
                        target: LOG_TARGET,
                        "{} exceeded {} retries, presumed lost",
                        self.peer,
                        self.config.max_retries
                    );
                    self.terminate(DisconnectReason::RetryLimit);
                    return;
                }

                if self.state == ConnectionState::Disconnecting {
                    if self.pending.is_empty() {
                        self.close(DisconnectReason::Graceful, now);
                    }
                } else if now.saturating_duration_since(self.last_send)
                    >= self.config.keepalive_interval
                {
                    let sequence = self.take_sequence();
                    self.send_packet(Packet::new(sequence, PacketType::Alive), now);
                }
            }
        }
    }

    /// Stops accepting sends and closes once pending reliables are acked.
    pub fn disconnect(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connected => {
                log::debug!(
                    target: LOG_TARGET,
                    "{} disconnecting, {} reliable sends pending",
                    self.peer,
                    self.pending.len()
                );
                self.state = ConnectionState::Disconnecting;
                if self.pending.is_empty() {
                    self.close(DisconnectReason::Graceful, now);
                }
            }
            ConnectionState::Connecting => self.close(DisconnectReason::Graceful, now),
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {}
        }
    }

    /// Immediate local stop: tells the peer and abandons anything pending.
    pub fn close(&mut self, reason: DisconnectReason, now: Instant) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        let sequence = self.take_sequence();
        self.send_packet(Packet::new(sequence, PacketType::Close), now);
        self.terminate(reason);
    }

    pub fn ban(&mut self, now: Instant) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        let sequence = self.take_sequence();
        self.send_packet(Packet::new(sequence, PacketType::Ban), now);
        self.terminate(DisconnectReason::Banned);
    }

    fn on_syn(&mut self, sequence: u16, now: Instant) {
        if self.side == Side::Server
            && self.state == ConnectionState::Connecting
            && sequence == self.peer_handshake_sequence
        {
            self.send_handshake(now);
        } else {
            log::debug!(target: LOG_TARGET, "{} ignoring syn {} in {:?}", self.peer, sequence, self.state);
        }
    }

    fn on_syn_ack(&mut self, sequence: u16, syn_sequence: u16, now: Instant) {
        if self.side != Side::Client || syn_sequence != self.handshake_sequence {
            log::debug!(target: LOG_TARGET, "{} dropping unexpected syn-ack {}", self.peer, sequence);
            return;
        }

        match self.state {
            ConnectionState::Connecting => {
                self.received.accept(sequence);
                self.peer_handshake_sequence = sequence;
                self.send_packet(Packet::new(sequence, PacketType::Ack { bitfield: 0 }), now);
                self.establish();
            }
            // our ack was lost, the server is still waiting
            ConnectionState::Connected if sequence == self.peer_handshake_sequence => {
                self.send_packet(Packet::new(sequence, PacketType::Ack { bitfield: 0 }), now);
            }
            _ => {}
        }
    }

    fn on_ack(&mut self, ack: u16, bitfield: u32, now: Instant) {
        if self.state == ConnectionState::Connecting {
            if self.side == Side::Server && ack == self.handshake_sequence {
                self.establish();
            }
            return;
        }

        let stats = &mut self.stats;
        let before = self.pending.len();
        self.pending.retain(|pending| {
            if !is_acked(pending.sequence, ack, bitfield) {
                return true;
            }
            // only first transmissions give an unambiguous round trip
            if pending.retries == 0 {
                let rtt = now.saturating_duration_since(pending.last_sent);
                stats.record_rtt(rtt.as_secs_f32() * 1000.0);
            }
            false
        });
        let acked = before - self.pending.len();
        if acked > 0 {
            log::trace!(target: LOG_TARGET, "{} ack {} cleared {} pending", self.peer, ack, acked);
        }
    }

    fn establish(&mut self) {
        log::info!(target: LOG_TARGET, "{} connected to {}", self.peer, self.addr);
        self.state = ConnectionState::Connected;
        self.was_connected = true;
        self.events.push_back(ConnectionEvent::Connected);
    }

    fn terminate(&mut self, reason: DisconnectReason) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if !self.pending.is_empty() {
            log::debug!(
                target: LOG_TARGET,
                "{} abandoning {} pending reliable sends",
                self.peer,
                self.pending.len()
            );
            self.pending.clear();
        }
        self.state = ConnectionState::Disconnected;
        log::debug!(target: LOG_TARGET, "{} disconnected: {}", self.peer, reason.as_str());
        self.events.push_back(ConnectionEvent::Disconnected(reason));
    }

    /// Resends overdue reliables. Returns false once an entry runs out of retries.
    fn retransmit(&mut self, now: Instant) -> bool {
        let mut resend = Vec::new();
        for pending in self.pending.iter_mut() {
            if now.saturating_duration_since(pending.last_sent) < self.config.retry_interval {
                continue;
            }
            if pending.retries >= self.config.max_retries {
                return false;
            }
            pending.retries += 1;
            pending.last_sent = now;
            resend.push(pending.datagram.clone());
        }

        for datagram in resend {
            self.stats.retransmissions += 1;
            self.transmit(datagram, now);
        }
        true
    }

    fn send_handshake(&mut self, now: Instant) {
        let payload = match self.side {
            Side::Client => PacketType::Syn,
            Side::Server => PacketType::SynAck {
                syn_sequence: self.peer_handshake_sequence,
            },
        };
        self.handshake_sent_at = now;
        self.send_packet(Packet::new(self.handshake_sequence, payload), now);
    }

    fn send_packet(&mut self, packet: Packet, now: Instant) -> bool {
        match packet.encode() {
            Ok(datagram) => {
                self.transmit(datagram, now);
                true
            }
            Err(e) => {
                log::warn!(target: LOG_TARGET, "{} dropping outbound packet: {}", self.peer, e);
                false
            }
        }
    }

    fn transmit(&mut self, datagram: Vec<u8>, now: Instant) {
        self.stats.record_sent(datagram.len());
        self.last_send = now;
        self.outbox.push(datagram);
    }

    fn take_sequence(&mut self) -> u16 {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.wrapping_add(1);
        sequence
    }

    fn is_established(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }

    fn drop_duplicate(&mut self, sequence: u16, kind: &str) {
        self.stats.duplicates_dropped += 1;
        log::debug!(target: LOG_TARGET, "{} dropped duplicate {} {}", self.peer, kind, sequence);
    }

    fn drop_early(&self, sequence: u16) {
        log::debug!(
            target: LOG_TARGET,
            "{} dropped data packet {} before handshake completed",
            self.peer,
            sequence
        );
    }
}

fn is_acked(sequence: u16, ack: u16, bitfield: u32) -> bool {
    if sequence == ack {
        return true;
    }
    if !sequence_greater_than(ack, sequence) {
        return false;
    }
    let diff = ack.wrapping_sub(sequence) as u32;
    diff <= u32::BITS && bitfield & (1 << (diff - 1)) != 0
}
