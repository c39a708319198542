//! # Parley Chat Server
//!
//! Single-node chat server: binary request/response protocol over TCP, an
//! in-memory model journaled to an append-only transaction log, and
//! best-effort federation through a relay.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use parley_server::config::{CliOverrides, ServerConfig};
use parley_server::controller::Controller;
use parley_server::journal::{self, Journal};
use parley_server::models::Secret;
use parley_server::relay::{NoRelay, Relay};
use parley_server::server::Server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server bind address
    #[arg(short = 'a', long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Generator number for this server's ids (0 = random per boot)
    #[arg(short = 'i', long)]
    server_id: Option<u32>,

    /// Relay credential
    #[arg(long)]
    secret: Option<String>,

    /// Directory holding the transaction log
    #[arg(short = 'd', long)]
    data_dir: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,
}

fn random_server_id() -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(Path::new(path))?,
        None => ServerConfig::default(),
    };
    config.apply_cli(&CliOverrides {
        host: args.host,
        port: args.port,
        server_id: args.server_id,
        secret: args.secret,
        data_dir: args.data_dir,
    });

    info!("Starting Parley Chat Server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Bind address: {}:{}", config.host, config.port);

    let generator = if config.server_id != 0 {
        config.server_id
    } else {
        let id = random_server_id();
        warn!(
            "no server id configured — using random id {} for this run; \
             pin server_id in the config for a stable federation identity",
            id
        );
        id
    };
    info!("Server id: {}", generator);

    let log_path = config.transaction_log();
    let journal = Journal::open(&log_path)
        .with_context(|| format!("opening transaction log {}", log_path.display()))?;
    let mut controller = Controller::new(generator, journal);
    if let Err(e) = journal::replay_file(&log_path, &mut controller) {
        warn!("could not load transaction log: {}", e);
    }

    let relay: Arc<dyn Relay> = Arc::new(NoRelay);
    let secret = Secret::new(config.secret.clone().into_bytes());
    let server = Server::start(generator, controller, relay, secret);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    println!("🗨️  Parley Chat Server starting...");
    println!("📡 Listening on {}", addr);
    println!("🧾 Transaction log: {}", log_path.display());
    println!("⚡ One request/response pair per connection");

    info!("Server successfully bound to {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                server.handle_connection(stream);
            }
            Err(e) => {
                warn!("accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
