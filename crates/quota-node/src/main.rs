//! quota-node — the quota-ledger service binary.
//!
//! Startup sequence:
//!   1. Connect to Redis (counter store + lock provider) and Postgres (source of truth)
//!   2. Wire the Usage Overview Service facade and the Event Sink
//!   3. Run the main loop: drain inbound lifecycle events into the Event Sink

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use quota_core::config::LedgerConfig;
use quota_db::PostgresDbAdapter;
use quota_events::{EventSink, LifecycleEvent};
use quota_lock::RedisLockProvider;
use quota_service::{DbBackedOrganizationRepo, UsageOverviewService};
use quota_store::RedisQuotaStore;

#[derive(Parser, Debug)]
#[command(name = "quota-node", version, about = "Organization quota-usage accounting core")]
struct Args {
    /// Redis connection string backing the counter store and lock provider.
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Postgres connection string for the source-of-truth projection.
    #[arg(long, default_value = "postgres://localhost/quota")]
    database_url: String,

    /// TTL applied to every confirmed/pending counter key on write.
    #[arg(long, default_value_t = 30)]
    cache_ttl_secs: u64,

    /// Maximum age a staleness stamp may reach before a forced rehydrate.
    #[arg(long, default_value_t = 3_600_000)]
    cache_max_age_ms: u64,

    /// TTL of a held distributed lock before it auto-expires.
    #[arg(long, default_value_t = 10)]
    lock_ttl_secs: u64,

    /// Upper bound on how long lock acquisition retries before giving up.
    #[arg(long, default_value_t = 5_000)]
    lock_wait_timeout_ms: u64,

    /// Inbound lifecycle-event channel capacity.
    #[arg(long, default_value_t = 1024)]
    event_channel_capacity: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,quota=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("quota-node starting");

    let redis_client = redis::Client::open(args.redis_url.as_str()).context("building redis client")?;
    let redis_conn = redis_client
        .get_connection_manager()
        .await
        .context("connecting to redis")?;

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&args.database_url)
        .await
        .context("connecting to postgres")?;

    let config = LedgerConfig {
        cache_ttl_seconds: args.cache_ttl_secs,
        cache_max_age_ms: args.cache_max_age_ms,
        lock_ttl_seconds: args.lock_ttl_secs,
        lock_wait_timeout_ms: args.lock_wait_timeout_ms,
    };

    let store = Arc::new(RedisQuotaStore::new(
        redis_conn.clone(),
        config.cache_ttl_seconds,
        config.cache_max_age_ms,
    ));
    let lock = Arc::new(RedisLockProvider::new(
        redis_conn,
        config.lock_ttl_seconds,
        config.lock_wait_timeout_ms,
    ));
    let db = Arc::new(PostgresDbAdapter::new(pg_pool));
    let orgs = Arc::new(DbBackedOrganizationRepo::new(db.clone()));

    // Wired up for a future query-serving layer; this binary only drains
    // lifecycle events for now.
    let _service = UsageOverviewService::new(store.clone(), lock.clone(), db, orgs);
    let sink = EventSink::new(store, lock);

    let (_event_sender, mut event_receiver) =
        tokio::sync::mpsc::channel::<LifecycleEvent>(args.event_channel_capacity);

    info!("quota-node ready");
    while let Some(event) = event_receiver.recv().await {
        sink.handle(event).await;
    }

    Ok(())
}
