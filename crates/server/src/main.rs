mod config;
mod events;
mod player;
mod server;
mod simulation;

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use config::ServerConfig;
use server::GameServer;
use tether::{PacketLossSimulation, RegistryConfig};

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Dedicated replication server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = tether::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 30)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, help = "Enable global packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0.0, help = "Duplicated packet percentage (0-100)")]
    duplicate_percent: f32,

    #[arg(long, help = "Stop after this many seconds")]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let global_packet_loss = args.simulate_packet_loss.then(|| PacketLossSimulation {
        enabled: true,
        loss_percent: args.loss_percent,
        duplicate_percent: args.duplicate_percent,
    });

    let config = ServerConfig {
        tick_rate: args.tick_rate,
        registry: RegistryConfig::server(args.max_clients),
        global_packet_loss,
        ..Default::default()
    };

    let mut server = GameServer::new(&bind_addr, config)
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    if let Some(seconds) = args.duration {
        let running = server.running();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(seconds));
            running.store(false, Ordering::SeqCst);
        });
    }

    log::info!("Server started on {}", server.local_addr());
    server.run()?;
    log::info!("Server shutting down");

    Ok(())
}
