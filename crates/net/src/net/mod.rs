mod clock;
mod config;
mod connection;
mod events;
mod filter;
mod packet;
mod registry;
mod sequence;
mod socket;
mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConnectionConfig, RegistryConfig};
pub use connection::{Connection, ConnectionState, Side};
pub use events::{ConnectionEvent, DisconnectReason, GroupId, PeerId, RegistryEvent};
pub use filter::RecipientFilter;
pub use packet::{
    DEFAULT_PORT, HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, Packet, PacketError,
    PacketHeader, PacketKind, PacketType,
};
pub use registry::{ConnectionRegistry, Fanout};
pub use sequence::{SequenceTracker, sequence_greater_than, sequence_less_than};
pub use socket::{DatagramSocket, LossySocket, MemoryNetwork, MemorySocket, UdpTransport};
pub use stats::{NetworkStats, PacketLossSimulation};
