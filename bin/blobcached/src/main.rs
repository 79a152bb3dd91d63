//! blobcached - memcache-protocol persistent blob cache daemon

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use blobcache_common::{Allocator, BufferPool, MAX_SHARDS, MAX_VALUE_SIZE};
use blobcache_storage::{Cache, CacheOptions};
use clap::{ArgAction, Parser};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server::MemcacheServer;

#[derive(Parser, Debug)]
#[command(name = "blobcached")]
#[command(about = "Memcache-protocol persistent blob cache daemon")]
#[command(version)]
struct Args {
    /// Address to listen on; a bare `:port` binds all interfaces
    #[arg(long, default_value = ":11211")]
    addr: String,

    /// Directory used to store cache items
    #[arg(long, default_value = "cachedata")]
    path: PathBuf,

    /// Total cache file size in bytes
    #[arg(long, default_value_t = 32 * MAX_VALUE_SIZE)]
    size: i64,

    /// Number of cache shards (for concurrency; max 128)
    #[arg(long, default_value_t = 16)]
    shards: i64,

    /// Cache-wide TTL of items in seconds; 0 disables it
    #[arg(long, default_value_t = 0)]
    ttl: i64,

    /// Print the version and exit
    #[arg(short = 'v', action = ArgAction::Version)]
    show_version: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // size: at least room for two max-size values
    let mut size = args.size;
    if size <= 2 * MAX_VALUE_SIZE {
        size = 2 * MAX_VALUE_SIZE;
        warn!(size, "cache size invalid, adjusted");
    }

    // shards: within (0, 128] and big enough to hold one max-size value each
    let mut shards = args.shards;
    if shards <= 0 || shards > MAX_SHARDS as i64 || size / shards < MAX_VALUE_SIZE {
        shards = 16;
        if size / shards < MAX_VALUE_SIZE {
            shards = size / MAX_VALUE_SIZE;
        }
        warn!(shards, "cache shards invalid, adjusted");
    }

    let ttl = args.ttl.max(0);

    let addr = if args.addr.starts_with(':') {
        format!("0.0.0.0{}", args.addr)
    } else {
        args.addr.clone()
    };
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    let allocator: Arc<dyn Allocator> = Arc::new(BufferPool::new());
    let cache = Cache::open(
        &args.path,
        CacheOptions {
            shard_num: shards as usize,
            size,
            ttl,
            allocator: Some(Arc::clone(&allocator)),
            disable_gc: false,
        },
    )
    .with_context(|| format!("open cache at {}", args.path.display()))?;

    info!(
        version = server::VERSION,
        path = %args.path.display(),
        size,
        shards,
        ttl,
        "blobcached starting"
    );

    MemcacheServer::new(cache, allocator).serve(listener).await
}
