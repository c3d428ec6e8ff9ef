use tether::{PacketLossSimulation, RegistryConfig, ReplicationConfig};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub registry: RegistryConfig,
    pub replication: ReplicationConfig,
    /// Health points restored per second.
    pub health_regen: f32,
    pub global_packet_loss: Option<PacketLossSimulation>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 30,
            registry: RegistryConfig::server(32),
            replication: ReplicationConfig::default(),
            health_regen: 5.0,
            global_packet_loss: None,
        }
    }
}
