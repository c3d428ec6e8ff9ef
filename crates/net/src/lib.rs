pub mod message;
pub mod net;
pub mod replication;
pub mod wire;

pub use message::{IncomingMessage, MessageClass, MessageError, OutgoingMessage};
pub use net::{
    Clock, Connection, ConnectionConfig, ConnectionEvent, ConnectionRegistry, ConnectionState,
    DEFAULT_PORT, DatagramSocket, DisconnectReason, GroupId, LossySocket, MAX_PACKET_SIZE,
    ManualClock, MemoryNetwork, NetworkStats, Packet, PacketError, PacketLossSimulation, PacketType,
    PeerId, RecipientFilter, RegistryConfig, RegistryEvent, SequenceTracker, SystemClock,
    UdpTransport,
};
pub use replication::{
    Client, ClientEntityManager, Entity, EntityId, EntityManager, EntityType, ReplicatedVariable,
    ReplicationBatch, ReplicationConfig, ReplicationError, Role, Server, ServerEntityManager,
    Variable, VariableIndex,
};
pub use wire::{WireDecode, WireEncode, WireError, WireReader, WireValue, WireWriter};
