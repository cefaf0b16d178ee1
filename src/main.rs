//! Command line interface for operating the relay. Supports initialization,
//! ingesting events from files, serving the WebSocket and HTTP endpoints,
//! re-verifying stored events, and sweeping expired rows.

mod config;
mod event;
mod filter;
mod ingest;
mod mirror;
mod server;
mod storage;
mod subs;
mod validate;
mod ws;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use config::Settings;
use storage::Store;
use subs::Registry;
use validate::Validator;
use ws::RelayCtx;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "quarry", author, version, about = "SQLite-backed Nostr relay")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the `.env` scaffold and the database schema.
    Init,
    /// Validate and store one or more JSON event files.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Launch the WebSocket and HTTP services.
    Serve,
    /// Re-verify id and signature for a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
    /// Physically delete expired events.
    Sweep,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    // Opening the store also bootstraps the schema.
    let store = Store::open(&cfg.db_path, cfg.max_limit)?;
    match cli.command {
        Commands::Init => {
            info!(db = %cfg.db_path.display(), "database initialized");
        }
        Commands::Ingest { files } => {
            for file in files {
                let data = fs::read_to_string(&file)?;
                let ev: event::Event = serde_json::from_str(&data)
                    .with_context(|| format!("parsing {file}"))?;
                ev.check_structure()
                    .map_err(|e| anyhow::anyhow!("{file}: {e}"))?;
                validate::verify_event(&ev).map_err(|e| anyhow::anyhow!("{file}: {e}"))?;
                let outcome = store.put(&ev)?;
                info!(file = %file, event = %ev.id, ?outcome, "ingested");
            }
        }
        Commands::Serve => {
            let http_addr: SocketAddr = cfg.bind_http.parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.parse()?;
            let registry = Registry::new();
            let mirror_tx = cfg.search_index_url.clone().map(mirror::spawn);
            let ingest_tx = ingest::spawn(store.clone(), registry.clone(), mirror_tx);
            let validator = Validator::new(cfg.policy(), cfg.trust_oracle());
            let ctx = RelayCtx::new(store.clone(), registry, validator, ingest_tx);

            let sweep_store = store.clone();
            let sweep_interval = cfg.sweep_interval.max(1);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match sweep_store.sweep_expired() {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "swept expired events"),
                        Err(e) => warn!(error = %e, "expiration sweep failed"),
                    }
                }
            });

            info!(%ws_addr, %http_addr, "relay listening");
            tokio::try_join!(
                server::serve_http(http_addr, store, std::future::pending()),
                ws::serve_ws(ws_addr, ctx, std::future::pending())
            )?;
        }
        Commands::Verify { sample } => {
            let checked = store.verify_sample(sample)?;
            info!(checked, "verification passed");
        }
        Commands::Sweep => {
            let removed = store.sweep_expired()?;
            info!(removed, "swept expired events");
        }
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let db_path = base_dir.join("quarry.db");
    let mut content = String::new();
    content.push_str(&format!("DB_PATH={}\n", display_path(&db_path)));
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str("BIND_WS=127.0.0.1:7778\n");
    content.push_str("MAX_LIMIT=500\n");
    content.push_str("MIN_POW=0\n");
    content.push_str("AUTH_REQUIRED=0\n");
    content.push_str("RESTRICTED_PUBKEYS=\n");
    content.push_str("TRUSTED_PUBKEYS=\n");
    content.push_str("RATE_LIMIT_EVENTS=0\n");
    content.push_str("RATE_LIMIT_WINDOW=60\n");
    content.push_str("SWEEP_INTERVAL=600\n");
    content.push_str("SEARCH_INDEX_URL=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}
