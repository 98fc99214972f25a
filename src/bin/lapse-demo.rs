//! LAPSE Demo
//!
//! Fills an in-memory store with expiring items, simulates a restart,
//! and lets the expiry service recover and expire them.

use bytes::Bytes;
use chrono::Utc;
use clap::Parser;
use lapse::config::{CACHE_LOADER_INTERVAL, EXPIRY_INTERVAL, MAX_STREAMS_PER_CYCLE};
use lapse::{AlarmScheduler, ExpiryService, MemoryStore, Properties, StreamId};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// LAPSE - expiry daemon and restart recovery demo
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Expiry sweep interval in milliseconds
    #[arg(long, default_value_t = 250)]
    expiry_interval_ms: u64,

    /// Cache loader interval in seconds
    #[arg(long, default_value_t = 1)]
    cache_loader_interval: u64,

    /// Streams reloaded per cache loader cycle
    #[arg(long, default_value_t = 4)]
    max_streams_per_cycle: usize,

    /// Number of streams to create
    #[arg(long, default_value_t = 12)]
    streams: i64,

    /// Items per stream
    #[arg(long, default_value_t = 50)]
    items_per_stream: usize,

    /// Largest time-to-live in milliseconds; items get spread TTLs up to this
    #[arg(long, default_value_t = 4000)]
    max_ttl_ms: i64,

    /// How long to run after the restart, in seconds
    #[arg(long, default_value_t = 8)]
    run_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lapse=info".parse()?))
        .init();

    let args = Args::parse();
    // LAPSE_* environment variables win over the command line defaults
    let mut properties = Properties::from_env();
    for (key, value) in [
        (EXPIRY_INTERVAL, args.expiry_interval_ms.to_string()),
        (CACHE_LOADER_INTERVAL, args.cache_loader_interval.to_string()),
        (MAX_STREAMS_PER_CYCLE, args.max_streams_per_cycle.to_string()),
    ] {
        if properties.get(key).is_none() {
            properties.set(key, value);
        }
    }

    let store = MemoryStore::new();
    let now = Utc::now().timestamp_millis();
    let total = args.streams.max(0) as usize * args.items_per_stream;
    for stream in 1..=args.streams {
        for n in 0..args.items_per_stream {
            let ttl = (n as i64 * 97 + stream * 31) % args.max_ttl_ms.max(1);
            let payload = Bytes::from(format!("stream {stream} item {n}"));
            store.put(StreamId(stream), payload, now + ttl)?;
        }
    }
    info!(items = total, streams = args.streams, "store filled");

    store.simulate_restart();

    let scheduler = AlarmScheduler::try_current()
        .ok_or_else(|| anyhow::anyhow!("no tokio runtime"))?;
    let service = ExpiryService::for_memory_store("demo", properties, &store, scheduler);
    service.start()?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    for _ in 0..args.run_secs {
        ticker.tick().await;
        info!(
            remaining = store.len(),
            resident = store.resident_len(),
            indexed = service.expiry_index_size(),
            "progress"
        );
    }

    service.stop();
    println!("{}", service.dump());
    Ok(())
}
