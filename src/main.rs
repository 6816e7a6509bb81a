//! flagsub: a flag submission server for attack/defense CTFs
//!
//! Teams connect over TCP, read a banner terminated by an empty line and
//! then submit one flag per line. Every flag is answered with
//! `<flag> <CODE> <message>`, where the code is one of:
//! - `OK`: accepted and scored
//! - `DUP`: already submitted by this team
//! - `OWN`: the team's own flag
//! - `OLD`: expired
//! - `INV`: not a valid flag
//! - `ERR`: temporary failure, retry later
//!
//! Features:
//! - Pipelined submissions, answered in completion order
//! - Team identification from VPN addresses
//! - Issued flags loaded from (and periodically refreshed from) a TOML file
//! - Configuration via CLI arguments or TOML file

mod clock;
mod config;
mod protocol;
mod server;
mod session;
mod storage;
mod team;
mod validator;

use clock::GameClock;
use config::{Config, ConfigError};
use server::Server;
use std::sync::Arc;
use storage::MemoryStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        address = %config.listen_addr(),
        max_connections = config.max_connections,
        valid_ticks = config.valid_ticks,
        tick_duration = config.tick_duration,
        game_start = ?config.game_start,
        "Starting flagsub server"
    );

    let flags_file = config.flags_file.clone().ok_or_else(|| {
        ConfigError::Invalid("no flags file configured (--flags-file or [store] flags_file)".into())
    })?;
    let clock = GameClock::new(config.game_start, config.tick_duration);
    let store = MemoryStore::from_file(&flags_file, clock)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime
        .block_on(run(config, Arc::new(store)))
        .map_err(|e| e as Box<dyn std::error::Error>)
}

/// Serve until the listener fails or SIGINT arrives
async fn run(
    config: Config,
    store: Arc<MemoryStore>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let server = Server::new(config, store);

    tokio::select! {
        result = server.run() => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
            Ok(())
        }
    }
}
