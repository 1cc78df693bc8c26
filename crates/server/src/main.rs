mod config;
mod demo;
mod events;
mod jobs;
mod server;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use ricochet::ArenaWorld;
use server::GameServer;

#[derive(Parser)]
#[command(name = "ricochet-server")]
#[command(about = "Ricochet dedicated server")]
struct Args {
    /// JSON config file; CLI flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    tick_rate: Option<u32>,

    #[arg(short, long)]
    max_clients: Option<usize>,

    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Send a snapshot every tick instead of every other tick
    #[arg(long)]
    high_bandwidth: bool,

    /// Record the game to a demo file
    #[arg(long)]
    record: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(tick_rate) = args.tick_rate {
        config.tick_rate = tick_rate;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(password) = args.password {
        config.password = password;
    }
    if args.high_bandwidth {
        config.high_bandwidth = true;
    }
    if args.record.is_some() {
        config.demo_path = args.record;
    }

    let world = ArenaWorld::new(config.max_clients);
    let mut server = GameServer::new(config, world)?;
    server.run()
}
