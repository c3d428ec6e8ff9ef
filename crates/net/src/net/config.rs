use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub handshake_timeout: Duration,
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
    pub max_pending_reliable: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(200),
            max_retries: 10,
            keepalive_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            max_pending_reliable: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub max_connections: usize,
    /// Servers accept inbound Syn; clients only dial out.
    pub accept_incoming: bool,
    pub receive_timeout: Option<Duration>,
    pub connection: ConnectionConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 32,
            accept_incoming: false,
            receive_timeout: Some(Duration::from_millis(50)),
            connection: ConnectionConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn server(max_connections: usize) -> Self {
        Self {
            max_connections,
            accept_incoming: true,
            ..Default::default()
        }
    }

    pub fn client() -> Self {
        Self::default()
    }
}
