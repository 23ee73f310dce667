//! Tandem relay server.
//!
//! Usage:
//!   tandem-relay --port 1234
//!   PORT=8080 tandem-relay
//!
//! Clients connect to `ws://host:port/<room>`; an empty path joins the
//! default room. Documents live in memory for the lifetime of the process.
//! Logging is controlled with `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use clap::Parser;
use tandem_collab::{ServerConfig, SyncServer, DEFAULT_ROOM};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "tandem-relay")]
#[command(about = "Real-time CRDT relay for shared flow graphs")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 1234)]
    port: u16,

    /// Interface to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Room joined by clients connecting without a path
    #[arg(long, default_value = DEFAULT_ROOM)]
    default_room: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ServerConfig::default()
        .with_host(args.host)
        .with_port(args.port)
        .with_default_room(args.default_room);
    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;

    log::info!("Tandem relay starting (default room: {})", config.default_room);
    let server = SyncServer::new(config);
    server
        .serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let stats = server.handle().stats().await?;
    log::info!(
        "Relay stopped: {} rooms, {} sessions served, {} updates applied",
        stats.rooms,
        stats.total_sessions,
        stats.updates_applied
    );
    Ok(())
}
