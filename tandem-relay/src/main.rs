//! Tandem relay: hosts collaboration rooms over WebSocket.
//!
//! Every room keeps an authoritative replicated document, answers the
//! sync handshake for joining clients and fans updates out to the other
//! members. `--status-addr` additionally serves `GET /status`.

use clap::Parser;
use log::{error, info};
use tandem_collab::server::{ServerConfig, SyncServer};

/// Real-time relay for collaborative diagram editing
#[derive(Parser, Debug)]
#[command(name = "tandem-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// WebSocket listen address
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Serve the HTTP status endpoint on this address
    #[arg(long, value_name = "ADDR")]
    status_addr: Option<String>,

    /// Refuse joins beyond this many peers per room
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Per-room broadcast buffer; slower peers skip ahead past it
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind,
            status_addr: args.status_addr,
            max_peers_per_room: args.max_peers,
            broadcast_capacity: args.broadcast_capacity,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server = SyncServer::new(args.into());
    info!("Starting Tandem relay on {}", server.bind_addr());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let status = server.status().await;
            info!(
                "Shutting down with {} rooms and {} connections",
                status.rooms, status.connections
            );
        }
    }
}
