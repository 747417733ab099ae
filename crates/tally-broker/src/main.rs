//! # tally-broker
//!
//! Broker binary: loads settings, opens the snapshot store and serves
//! WebSocket subscriptions until Ctrl-C.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tally_core::OwnerKey;
use tally_server::{Broker, BrokerServer, ServerConfig};
use tally_settings::{StoreBackend, StoreSettings, TallySettings};
use tally_store::{ConnectionConfig, MemoryStore, SharedStore, SqliteStore};
use tracing::{info, warn};

/// Real-time billing change broker.
#[derive(Parser, Debug)]
#[command(name = "tally-broker", about = "Real-time billing change broker", version)]
struct Cli {
    /// Settings file (default `~/.tally/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker (default).
    Serve(ServeArgs),
    /// Write an owner's snapshot into the SQLite store.
    Put(PutArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Use the in-memory store instead of `SQLite`.
    #[arg(long, conflicts_with = "db_path")]
    memory: bool,

    /// JSON file of `{"<ownerKey>": <payload>, ...}` written into the store
    /// before serving.
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PutArgs {
    /// Owner whose snapshot is written.
    #[arg(long)]
    owner: String,

    /// JSON file holding the snapshot payload.
    #[arg(long)]
    file: PathBuf,

    /// Path to the `SQLite` database.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

impl ServeArgs {
    /// CLI flags take precedence over file and env settings.
    fn apply(&self, settings: &mut TallySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(path) = &self.db_path {
            settings.store.backend = StoreBackend::Sqlite;
            settings.store.db_path = path.to_string_lossy().into_owned();
        }
        if self.memory {
            settings.store.backend = StoreBackend::Memory;
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<TallySettings> {
    let path = path.map_or_else(tally_settings::settings_path, Path::to_path_buf);
    tally_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

fn open_sqlite(store: &StoreSettings) -> Result<SqliteStore> {
    let path = store.resolved_db_path();
    let config = ConnectionConfig {
        pool_size: store.pool_size,
        ..ConnectionConfig::default()
    };
    SqliteStore::open(
        &path,
        &config,
        Duration::from_millis(store.poll_interval_ms),
    )
    .with_context(|| format!("Failed to open database: {}", path.display()))
}

/// Read a seed file: a JSON object mapping owner keys to snapshot payloads.
fn load_seed(path: &Path) -> Result<Vec<(OwnerKey, serde_json::Value)>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&body).context("Seed file is not valid JSON")?;
    let serde_json::Value::Object(entries) = value else {
        anyhow::bail!("Seed file must be a JSON object keyed by owner");
    };
    entries
        .into_iter()
        .map(|(key, payload)| {
            let owner = OwnerKey::parse(&key)
                .with_context(|| format!("Invalid owner key in seed file: {key:?}"))?;
            Ok((owner, payload))
        })
        .collect()
}

fn build_store(
    store: &StoreSettings,
    seed: &[(OwnerKey, serde_json::Value)],
) -> Result<SharedStore> {
    let poll_interval = Duration::from_millis(store.poll_interval_ms);
    Ok(match store.backend {
        StoreBackend::Memory => {
            let memory = MemoryStore::new().with_heartbeat_interval(Some(poll_interval));
            for (owner, payload) in seed {
                memory.put_snapshot(owner, payload.clone());
            }
            Arc::new(memory)
        }
        StoreBackend::Sqlite => {
            let sqlite = open_sqlite(store)?;
            for (owner, payload) in seed {
                let _ = sqlite
                    .put_snapshot(owner, payload)
                    .with_context(|| format!("Failed to seed snapshot for {owner}"))?;
            }
            Arc::new(sqlite)
        }
    })
}

/// Write a snapshot file into the database. Returns the new version.
fn put_snapshot(mut store: StoreSettings, args: &PutArgs) -> Result<i64> {
    let owner = OwnerKey::parse(&args.owner).context("Owner key must be non-empty")?;
    let body = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let payload: serde_json::Value =
        serde_json::from_str(&body).context("Snapshot file is not valid JSON")?;
    if let Some(path) = &args.db_path {
        store.db_path = path.to_string_lossy().into_owned();
    }
    let sqlite = open_sqlite(&store)?;
    sqlite
        .put_snapshot(&owner, &payload)
        .context("Failed to write snapshot")
}

fn init_logging(settings: &TallySettings) {
    let level = settings.logging.level.as_filter_str();
    if settings.logging.json {
        tally_core::logging::init_json_subscriber(level);
    } else {
        tally_core::logging::init_subscriber(level);
    }
}

async fn serve(settings: TallySettings, seed: Option<&Path>) -> Result<()> {
    let seed = seed.map(load_seed).transpose()?.unwrap_or_default();
    let store = build_store(&settings.store, &seed)?;
    let config = ServerConfig::from_settings(&settings);
    let broker = Arc::new(Broker::new(store, &config.broker_config()));

    let mut server = BrokerServer::new(config, Arc::clone(&broker));
    match tally_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(error) => warn!(%error, "metrics recorder unavailable, /metrics disabled"),
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!(
        backend = ?settings.store.backend,
        seeded = seed.len(),
        "tally broker listening on http://{addr} (ws://{addr}/ws)"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("shutting down");
    let aborted = server.shutdown().graceful_shutdown(vec![handle], None).await;
    let closed_watches = broker.shutdown();
    info!(closed_watches, aborted, "shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(cli.settings.as_deref())?;
    init_logging(&settings);

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => {
            args.apply(&mut settings);
            serve(settings, args.seed.as_deref()).await
        }
        Command::Put(args) => {
            let version = put_snapshot(settings.store, &args)?;
            info!(owner = %args.owner, version, "snapshot written");
            Ok(())
        }
    }
}
