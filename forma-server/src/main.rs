//! Forma sync server.
//!
//! Loads an optional JSON config file, applies command line overrides and
//! serves rooms over WebSocket until interrupted. Log verbosity follows
//! `RUST_LOG`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use forma_collab::room::CollabEvent;
use forma_collab::server::{ServerConfig, SyncServer};
use forma_core::{ResolutionStrategy, Role};
use log::{debug, error, info, warn};
use tokio::sync::broadcast;

#[derive(Debug, Parser)]
#[command(name = "forma-server", version, about = "Real-time form collaboration server")]
struct Cli {
    /// JSON configuration file; command line flags override it.
    #[arg(long, short, env = "FORMA_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the WebSocket listener to.
    #[arg(long, env = "FORMA_BIND_ADDR")]
    bind: Option<String>,

    /// RocksDB directory for snapshots. In-memory when unset.
    #[arg(long, env = "FORMA_STORAGE_PATH")]
    storage: Option<PathBuf>,

    /// Conflict strategy: lww, fww, ot or priority.
    #[arg(long, env = "FORMA_STRATEGY")]
    strategy: Option<ResolutionStrategy>,

    /// Role granted to users without an explicit entry.
    #[arg(long, env = "FORMA_DEFAULT_ROLE")]
    default_role: Option<Role>,

    /// Seconds without activity before a participant is dropped.
    #[arg(long)]
    presence_timeout_secs: Option<u64>,
}

fn load_config(cli: &Cli) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str(&raw).map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => ServerConfig::default(),
    };

    if let Some(bind) = &cli.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(storage) = &cli.storage {
        config.storage_path = Some(storage.clone());
    }
    if let Some(strategy) = cli.strategy {
        config.room.strategy = strategy;
    }
    if let Some(role) = cli.default_role {
        config.default_role = role;
    }
    if let Some(secs) = cli.presence_timeout_secs {
        config.room.presence_timeout_secs = secs;
    }
    Ok(config)
}

async fn log_events(mut events: broadcast::Receiver<CollabEvent>) {
    loop {
        match events.recv().await {
            Ok(CollabEvent::UserJoined { room_id, user_id, role }) => {
                info!("[{room_id}] {user_id} joined as {role}");
            }
            Ok(CollabEvent::UserLeft { room_id, user_id, reason }) => {
                info!("[{room_id}] {user_id} left ({reason:?})");
            }
            Ok(CollabEvent::ConflictResolved { room_id, conflict }) => {
                let winner = conflict.winner.as_ref().map(|op| op.author_id().to_string());
                info!(
                    "[{room_id}] conflict {} on document {} resolved for {winner:?}, {} loser(s)",
                    conflict.id,
                    conflict.document_id,
                    conflict.losers.len()
                );
            }
            Ok(CollabEvent::DocumentSynced {
                room_id,
                document_id,
                user_id,
                outcome,
            }) => debug!("[{room_id}] {user_id} synced {document_id}: {outcome}"),
            Ok(CollabEvent::OperationApplied { room_id, operation, version }) => debug!(
                "[{room_id}] {} by {} at version {version}",
                operation.kind().name(),
                operation.author_id()
            ),
            Ok(CollabEvent::PresenceChanged { room_id, user_id, state }) => {
                debug!("[{room_id}] {user_id} is {state:?}");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log lagging, skipped {skipped} event(s)");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Starting Forma server on {} (strategy {}, storage {})",
        config.bind_addr,
        config.room.strategy.as_str(),
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
    );

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };
    tokio::spawn(log_events(server.subscribe_events()));

    tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Server stopped: {e}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing {} room(s)", server.registry().room_count().await);
            server.shutdown().await;
            ExitCode::SUCCESS
        }
    }
}
