#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use twinbus::backend::memory::MemoryBackend;
use twinbus::backend::redis::RedisBackend;
use twinbus::backend::Backend;
use twinbus::config::{BackendKind, TwinTable};
use twinbus::identity::{Identity, KeyType};
use twinbus::relay::{App, DEFAULT_WORKERS};
use twinbus::twin::{CachedResolver, StaticResolver, TwinResolver};

#[derive(Parser)]
#[command(name = "twinbus", about = "Reliable message bus node", version)]
struct Args {
    /// Own twin id.
    #[arg(long)]
    twin: u32,

    /// Queue broker address.
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis: String,

    /// Broker implementation.
    #[arg(long, value_enum, default_value = "redis")]
    backend: BackendKind,

    /// Signing secret: a BIP-39 mnemonic, or a hex-encoded 32-byte seed.
    #[arg(long, env = "TWINBUS_MNEMONIC", hide_env_values = true)]
    mnemonic: String,

    /// Signature scheme of the identity.
    #[arg(long, value_enum, default_value = "sr25519")]
    key_type: KeyType,

    /// Number of worker tasks handling messages concurrently.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Twin table file (TOML) used by the static resolver.
    #[arg(long)]
    twins: PathBuf,

    /// Address the HTTP gateway binds.
    #[arg(long, default_value = "0.0.0.0:8051")]
    listen: SocketAddr,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).init();
}

/// Accept either a wallet mnemonic or a raw hex seed.
fn load_identity(secret: &str, key_type: KeyType) -> Result<Identity> {
    match Identity::from_mnemonic(secret, key_type) {
        Ok(identity) => Ok(identity),
        Err(mnemonic_err) => Identity::from_seed_hex(secret, key_type)
            .map_err(|_| mnemonic_err)
            .context("mnemonic is neither a valid phrase nor a hex seed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level);

    let identity = load_identity(&args.mnemonic, args.key_type)?;

    let backend: Arc<dyn Backend> = match args.backend {
        BackendKind::Redis => Arc::new(RedisBackend::connect(&args.redis).await?),
        BackendKind::Memory => {
            tracing::warn!("memory backend selected: queue state will not survive a restart");
            Arc::new(MemoryBackend::new())
        }
    };

    let table = TwinTable::load(&args.twins)?;
    tracing::info!("loaded {} twins from {}", table.twins.len(), args.twins.display());
    let resolver = Arc::new(CachedResolver::new(
        Arc::new(StaticResolver::new(table.twins)) as Arc<dyn TwinResolver>,
    ));

    let app = Arc::new(App::new(
        backend,
        resolver,
        Arc::new(identity),
        args.twin,
        args.workers,
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down...");
                cancel.cancel();
            }
        });
    }

    app.serve(args.listen, cancel).await
}
