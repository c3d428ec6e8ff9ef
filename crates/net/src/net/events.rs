use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Named peer subsets, used to scope sends and replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Graceful,
    Closed,
    Banned,
    Kicked,
    Timeout,
    HandshakeTimeout,
    RetryLimit,
    ServerFull,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Closed => "closed by peer",
            DisconnectReason::Banned => "banned",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::HandshakeTimeout => "handshake timed out",
            DisconnectReason::RetryLimit => "lost (retry limit)",
            DisconnectReason::ServerFull => "refused (server full)",
        }
    }
}

/// What a single connection reports back to its registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Message { payload: Vec<u8>, reliable: bool },
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Connected {
        peer: PeerId,
        addr: SocketAddr,
    },
    Disconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
    /// A handshake that never reached Connected.
    ConnectionFailed {
        peer: Option<PeerId>,
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    Message {
        peer: PeerId,
        payload: Vec<u8>,
        reliable: bool,
    },
}
