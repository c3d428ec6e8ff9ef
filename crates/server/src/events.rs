use std::net::SocketAddr;

use tether::{DisconnectReason, EntityId, PeerId};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected {
        peer: PeerId,
        addr: SocketAddr,
        entity: EntityId,
    },
    ClientDisconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    Chat {
        peer: PeerId,
        text: String,
    },
    Error {
        message: String,
    },
}
