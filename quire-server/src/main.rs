//! Quire sync server: the coordinator over a RocksDB store, gated by a token
//! table loaded from JSON.
//!
//! ```text
//! quire-server --bind 0.0.0.0:9090 --data-dir /var/lib/quire --tokens tokens.json
//! ```
//!
//! The token file maps each token to a grant:
//!
//! ```json
//! {
//!   "s3cret": { "user_id": "alice", "scope": "all" },
//!   "guest":  { "user_id": "guest", "scope": { "only": ["6f1c..."] }, "expires_at": 1767225600 }
//! }
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use quire_collab::storage::StoreConfig;
use quire_collab::{
    Coordinator, CoordinatorConfig, DocumentStore, MutationAuthority, MutatorRegistry, TokenGrant, TokenTable,
};

#[derive(Parser, Debug)]
#[clap(name = "quire-server")]
#[clap(about = "Collaborative document sync server", long_about = None)]
struct Args {
    /// Address to listen on
    #[clap(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB data directory
    #[clap(short, long, value_name = "DIR", default_value = "quire_data")]
    data_dir: PathBuf,

    /// JSON file mapping tokens to grants
    #[clap(short, long, value_name = "FILE")]
    tokens: PathBuf,

    /// Quiet period before buffered updates are written
    #[clap(long, value_name = "MS", default_value = "2000")]
    flush_debounce_ms: u64,

    /// Write a full snapshot every N flushes
    #[clap(long, value_name = "N", default_value = "10")]
    snapshot_every: u64,

    /// Fsync every write
    #[clap(long)]
    sync_writes: bool,

    /// Disable the /mutations endpoint
    #[clap(long)]
    no_mutations: bool,
}

fn parse_tokens(raw: &str) -> Result<HashMap<String, TokenGrant>> {
    Ok(serde_json::from_str(raw)?)
}

fn load_tokens(path: &Path) -> Result<TokenTable> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading token file {}", path.display()))?;
    let grants = parse_tokens(&raw).with_context(|| format!("parsing token file {}", path.display()))?;
    log::info!("Loaded {} tokens from {}", grants.len(), path.display());
    Ok(TokenTable::from_grants(grants))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let tokens = Arc::new(load_tokens(&args.tokens)?);
    let store = DocumentStore::open(StoreConfig {
        path: args.data_dir.clone(),
        sync_writes: args.sync_writes,
        ..StoreConfig::default()
    })
    .with_context(|| format!("opening store at {}", args.data_dir.display()))?;

    let config = CoordinatorConfig {
        bind_addr: args.bind,
        flush_debounce: Duration::from_millis(args.flush_debounce_ms),
        snapshot_every_flushes: args.snapshot_every.max(1),
        ..CoordinatorConfig::default()
    };
    let mut builder = Coordinator::builder(config, tokens).store(Arc::new(store));
    if !args.no_mutations {
        builder = builder.mutation_authority(Arc::new(MutationAuthority::new(MutatorRegistry::with_builtins())));
    }
    let coordinator = builder.build();

    let serving = coordinator.clone();
    let mut server = tokio::spawn(async move { serving.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for ctrl-c")?;
            log::info!("Interrupted; flushing open documents");
        }
        finished = &mut server => {
            finished.context("server task panicked")?.context("server failed")?;
        }
    }

    coordinator.shutdown().await;
    let stats = coordinator.stats();
    log::info!(
        "Stopped after {} connections, {} snapshots and {} update writes",
        stats.total_connections,
        stats.persisted_snapshots,
        stats.persisted_updates
    );
    Ok(())
}
