use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// Percentage of outgoing datagrams to drop, 0-100.
    pub loss_percent: f32,
    /// Percentage of outgoing datagrams to send twice, 0-100.
    pub duplicate_percent: f32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        self.enabled && self.loss_percent > 0.0 && rand_percent() * 100.0 < self.loss_percent
    }

    pub fn should_duplicate(&self) -> bool {
        self.enabled
            && self.duplicate_percent > 0.0
            && rand_percent() * 100.0 < self.duplicate_percent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duplicates_dropped: u64,
    pub retransmissions: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self {
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            duplicates_dropped: 0,
            retransmissions: 0,
            rtt_ms: 100.0,
            rtt_variance: 50.0,
        }
    }
}

impl NetworkStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn record_rtt(&mut self, rtt_ms: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt_ms - self.rtt_ms).abs();
        self.rtt_variance = (1.0 - BETA) * self.rtt_variance + BETA * diff;
        self.rtt_ms = (1.0 - ALPHA) * self.rtt_ms + ALPHA * rtt_ms;
    }
}

pub fn rand_percent() -> f32 {
    (rand_u64() % 10_000) as f32 / 10_000.0
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    hasher.write_u64(nanos);
    hasher.finish()
}

pub fn rand_u16() -> u16 {
    (rand_u64() >> 48) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_moves_toward_samples() {
        let mut stats = NetworkStats::default();
        for _ in 0..50 {
            stats.record_rtt(20.0);
        }
        assert!((stats.rtt_ms - 20.0).abs() < 1.0);
        assert!(stats.rtt_variance < 5.0);
    }

    #[test]
    fn disabled_simulation_never_drops() {
        let sim = PacketLossSimulation {
            enabled: false,
            loss_percent: 100.0,
            duplicate_percent: 100.0,
        };
        assert!(!sim.should_drop());
        assert!(!sim.should_duplicate());

        let always = PacketLossSimulation {
            enabled: true,
            loss_percent: 100.0,
            duplicate_percent: 0.0,
        };
        assert!(always.should_drop());
        assert!(!always.should_duplicate());
    }
}
