//! Entry point for `netcalc`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, argument parsing, console wiring).

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::BufReader;

use netcalc::client::Client;
use netcalc::config::{ClientConfig, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
use netcalc::console;
use netcalc::server::Server;

/// Calculator service over a bit-packed datagram protocol.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the server with an operator console on stdin.
    Server {
        /// Local address to bind.
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Refuse CONNECT while this many sessions are live.
        #[arg(long)]
        max_sessions: Option<usize>,
        /// Keep at most this many results per session, evicting the oldest.
        #[arg(long)]
        max_results: Option<usize>,
    },
    /// Connect to a server and read commands from stdin.
    Client {
        /// Server address.
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Liveness probe interval in milliseconds.
        #[arg(long, default_value_t = 1000)]
        probe_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            host,
            port,
            max_sessions,
            max_results,
        } => {
            let config = ServerConfig {
                addr: format!("{host}:{port}"),
                max_sessions,
                max_results_per_session: max_results,
                ..ServerConfig::default()
            };
            run_server(config).await
        }
        Mode::Client {
            host,
            port,
            probe_ms,
        } => {
            let config = ClientConfig {
                server: format!("{host}:{port}"),
                probe_interval: Duration::from_millis(probe_ms.max(1)),
                ..ClientConfig::default()
            };
            run_client(config).await
        }
    }
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let server = Server::bind(config).await?;
    let handle = server.handle();
    let listener = tokio::spawn(server.run());

    let stdin = BufReader::new(tokio::io::stdin());
    if let Err(e) = console::run_server(handle.clone(), stdin).await {
        log::error!("console failed: {e}");
    }

    handle.stop();
    listener.await.context("server task panicked")??;
    Ok(())
}

async fn run_client(config: ClientConfig) -> anyhow::Result<()> {
    let server = config.server.clone();
    let client = Client::connect(config)
        .await
        .with_context(|| format!("cannot connect to {server}"))?;
    println!("session {}", client.session_id());

    let stdin = BufReader::new(tokio::io::stdin());
    match console::run_client(client, stdin).await? {
        Some(client) => client.disconnect().await?,
        None => log::warn!("server went away; exiting"),
    }
    Ok(())
}
