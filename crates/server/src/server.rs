use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tether::{
    ConnectionRegistry, EntityId, IncomingMessage, LossySocket, MessageClass, OutgoingMessage,
    PeerId, RecipientFilter, RegistryEvent, ServerEntityManager, SystemClock, UdpTransport,
};

use crate::config::ServerConfig;
use crate::events::ServerEvent;
use crate::player::Player;
use crate::simulation::{initial_velocity, simulate_player};

const CHAT: &str = "Chat";

pub struct GameServer {
    registry: Arc<ConnectionRegistry>,
    entities: ServerEntityManager,
    players: HashMap<PeerId, EntityId>,
    config: ServerConfig,
    tick: u64,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    pending_events: VecDeque<ServerEvent>,
}

impl GameServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let transport = UdpTransport::bind(bind_addr)?;
        let clock = Arc::new(SystemClock);
        let registry = match &config.global_packet_loss {
            Some(simulation) => ConnectionRegistry::new(
                LossySocket::new(transport, simulation.clone()),
                clock,
                config.registry.clone(),
            ),
            None => ConnectionRegistry::new(transport, clock, config.registry.clone()),
        };
        let registry = Arc::new(registry);

        let mut entities = ServerEntityManager::new(config.replication.clone());
        entities.register::<Player>();

        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate.max(1) as f64);

        Ok(Self {
            registry,
            entities,
            players: HashMap::new(),
            tick: 0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            receiver: None,
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.registry.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn start(&mut self) -> io::Result<()> {
        if self.receiver.is_none() {
            self.receiver = Some(self.registry.spawn_receiver()?);
        }
        Ok(())
    }

    pub fn run(&mut self) -> io::Result<()> {
        self.start()?;
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            for event in self.drain_events() {
                log_event(&event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown()
    }

    pub fn shutdown(&mut self) -> io::Result<()> {
        let result = self.registry.shutdown();
        if let Some(receiver) = self.receiver.take() {
            if receiver.join().is_err() {
                log::error!("Receive thread panicked");
            }
        }
        result
    }

    pub fn kick_client(&mut self, peer: PeerId) {
        if self.registry.kick(peer) {
            self.despawn(peer);
        }
        self.process_network();
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        if let Err(e) = self.registry.update() {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("Network error: {}", e),
            });
        }
        self.process_network();

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }
    }

    fn tick(&mut self) {
        let dt = self.tick_duration.as_secs_f32();
        for &entity in self.players.values() {
            if let Some(player) = self.entities.get_mut::<Player>(entity) {
                simulate_player(player, dt, self.config.health_regen);
            }
        }

        let sent = self.entities.replicate(&self.registry);
        if sent > 0 {
            log::trace!("Tick {}: {} replication messages", self.tick, sent);
        }
        self.tick += 1;
    }

    fn process_network(&mut self) {
        for event in self.registry.drain_events() {
            match event {
                RegistryEvent::Connected { peer, addr } => self.spawn(peer, addr),
                RegistryEvent::Disconnected { peer, reason } => {
                    self.despawn(peer);
                    self.pending_events
                        .push_back(ServerEvent::ClientDisconnected { peer, reason });
                }
                RegistryEvent::ConnectionFailed { addr, reason, .. } => {
                    self.pending_events
                        .push_back(ServerEvent::ConnectionDenied { addr, reason });
                }
                RegistryEvent::Message { peer, payload, .. } => self.handle_message(peer, &payload),
            }
        }
    }

    fn spawn(&mut self, peer: PeerId, addr: SocketAddr) {
        // everything the peer missed, before its own player shows up
        self.entities
            .send_full_state(&self.registry, peer, &BTreeSet::new());

        let entity = match self.entities.create_entity::<Player>() {
            Ok(entity) => entity,
            Err(e) => {
                self.pending_events.push_back(ServerEvent::Error {
                    message: format!("no player for {}: {}", peer, e),
                });
                self.registry.kick(peer);
                return;
            }
        };

        if let Some(player) = self.entities.get_mut::<Player>(entity) {
            player.name.set(format!("player-{}", peer.id()));
            player.velocity = initial_velocity(peer.id());
        }
        self.players.insert(peer, entity);
        self.pending_events.push_back(ServerEvent::ClientConnected { peer, addr, entity });
    }

    fn despawn(&mut self, peer: PeerId) {
        if let Some(entity) = self.players.remove(&peer) {
            if let Err(e) = self.entities.destroy_entity(entity) {
                log::warn!("Failed to despawn {} for {}: {}", entity, peer, e);
            }
        }
    }

    fn handle_message(&mut self, peer: PeerId, payload: &[u8]) {
        let mut message = match IncomingMessage::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Dropping message from {}: {}", peer, e);
                return;
            }
        };

        if !message.is(MessageClass::User, CHAT) {
            log::debug!("Ignoring {:?} message {:?} from {}", message.class(), message.name(), peer);
            return;
        }

        let text = message.read_string();
        if message.has_failed() {
            log::debug!("Truncated chat from {}", peer);
            return;
        }

        let mut echo = OutgoingMessage::user(CHAT);
        echo.write_int(peer.id() as i32).write_string(&text);
        let mut everyone = RecipientFilter::all(&self.registry);
        echo.send(&mut everyone, &self.registry);

        self.pending_events.push_back(ServerEvent::Chat { peer, text });
    }
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientConnected { peer, addr, entity } => {
            log::info!("{} connected from {} ({})", peer, addr, entity);
        }
        ServerEvent::ClientDisconnected { peer, reason } => {
            log::info!("{} {}", peer, reason.as_str());
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            log::warn!("Connection from {} failed: {}", addr, reason.as_str());
        }
        ServerEvent::Chat { peer, text } => log::info!("[chat] {}: {}", peer, text),
        ServerEvent::Error { message } => log::error!("{}", message),
    }
}
