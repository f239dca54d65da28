//! Storage Element service entry point.
//!
//! Bootstraps the backend driver, metadata cache, WAL, and file engine,
//! validates the mode transition against the previous run, then starts
//! the HTTP surface with the health reporter and housekeeping loops
//! alongside. Shutdown deregisters from the registry before the process
//! exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use artstore::admin::keys::{JwtKey, KeySet};
use artstore::admin::tokens::TokenService;
use artstore::api::middleware::AuthState;
use artstore::api::se_handlers::SeState;
use artstore::api::se_routes;
use artstore::cache::store::MetadataCache;
use artstore::cache::sync::CacheSynchronizer;
use artstore::cache::tables::TableNames;
use artstore::core::config::{SeConfig, StorageType};
use artstore::health::HealthReporter;
use artstore::registry::client::RegistryClient;
use artstore::registry::lock::CacheLock;
use artstore::storage::engine::{EngineSettings, FileEngine};
use artstore::storage::local::LocalBackend;
use artstore::storage::mode::SeMode;
use artstore::storage::s3::S3Backend;
use artstore::storage::wal::WalStore;
use artstore::storage::StorageBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = SeConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    info!(
        element_id = %config.element_id,
        mode = %config.mode,
        "storage element starting"
    );

    // Persistence layer: table names resolve here, once.
    let tables = TableNames::for_prefix(&config.table_prefix)
        .map_err(|e| anyhow::anyhow!("table prefix: {e}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("database connect")?;

    let cache = MetadataCache::new(pool.clone(), tables.clone(), config.cache_ttl_hours());
    cache.ensure_schema().await.context("cache schema")?;

    // Mode transitions are only legal forward across restarts.
    if let Some(previous) = cache.load_previous_mode().await.context("previous mode")? {
        SeMode::validate_transition(previous, config.mode)
            .map_err(|e| anyhow::anyhow!("mode transition: {e}"))?;
    }
    cache
        .save_config(
            &config.element_id,
            config.mode,
            match config.storage_type {
                StorageType::Local => "local",
                StorageType::S3 => "s3",
            },
            config.capacity_total_bytes,
            config.retention_days,
            config.priority,
        )
        .await
        .context("persist config")?;

    let wal = WalStore::new(pool.clone(), tables.clone(), config.wal_enabled);
    wal.ensure_schema().await.context("wal schema")?;

    // Backend driver.
    let s3_backend: Option<Arc<S3Backend>> = match config.storage_type {
        StorageType::S3 => Some(Arc::new(S3Backend::new(
            config.s3.clone(),
            config.capacity_total_bytes,
        ))),
        StorageType::Local => None,
    };
    let backend: Arc<dyn StorageBackend> = match &s3_backend {
        Some(s3) => s3.clone(),
        None => Arc::new(LocalBackend::new(
            config.base_path.clone(),
            config.capacity_total_bytes,
        )),
    };

    // Registry and the cache lock.
    let registry = RegistryClient::connect(&config.redis_url)
        .await
        .context("redis connect")?;
    let redis_manager = redis::Client::open(config.redis_url.as_str())
        .context("redis client")?;
    let redis_manager = redis::aio::ConnectionManager::new(redis_manager)
        .await
        .context("redis manager")?;
    let lock = CacheLock::new(redis_manager, &config.element_id, Duration::from_secs(60));

    let synchronizer = Arc::new(CacheSynchronizer::new(
        cache.clone(),
        backend.clone(),
        lock,
        config.rebuild_timeout,
    ));

    let engine = Arc::new(FileEngine::new(
        EngineSettings {
            element_id: config.element_id.clone(),
            mode: config.mode,
            max_file_size_bytes: config.max_file_size_bytes,
            default_retention_days: config.retention_days,
            wal_retention_days: config.wal_retention_days,
        },
        backend.clone(),
        wal,
        cache.clone(),
        synchronizer,
    ));

    // Converge any in-flight state a crash left behind before serving.
    let swept = engine.recover().await.context("wal recovery")?;
    if swept > 0 {
        warn!(swept, "recovered non-terminal wal entries at startup");
    }

    // Token validation keys come from the Admin's published public key.
    let keys = Arc::new(KeySet::default());
    load_public_key(&config, &keys)?;
    let tokens = Arc::new(TokenService::new(
        keys.clone(),
        Duration::from_secs(1800),
        Duration::from_secs(7 * 86_400),
        Duration::from_secs(300),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Health reporter.
    let reporter = HealthReporter::new(config.clone(), backend.clone(), registry.clone());
    let reporter_handle = tokio::spawn(reporter.run(shutdown_rx.clone()));

    // Housekeeping: WAL retention, restore tickets, key reload, and the
    // S3 used-counter reconciliation.
    let housekeeping_handle = tokio::spawn(housekeeping(
        engine.clone(),
        config.clone(),
        keys.clone(),
        s3_backend,
        shutdown_rx.clone(),
    ));

    let state = SeState {
        engine,
        cache,
        config: Arc::new(config.clone()),
    };
    let router = se_routes::create_router(state, AuthState { tokens });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "storage element listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    // Stop background loops and deregister.
    shutdown_tx.send(true).ok();
    let _ = reporter_handle.await;
    housekeeping_handle.abort();
    info!("storage element stopped");
    Ok(())
}

/// Load the Admin-issued public validation key from disk.
fn load_public_key(config: &SeConfig, keys: &Arc<KeySet>) -> anyhow::Result<()> {
    let Some(path) = &config.jwt_public_key_path else {
        warn!("JWT_PUBLIC_KEY_PATH unset; bearer validation will reject all tokens");
        return Ok(());
    };
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("read public key {}", path.display()))?;
    keys.replace(vec![JwtKey {
        version: Uuid::new_v4(),
        private_key_pem: String::new(),
        public_key_pem: pem,
        created_at: chrono::Utc::now(),
        expires_at: chrono::Utc::now() + chrono::Duration::days(3650),
        is_active: true,
    }]);
    Ok(())
}

/// Periodic local maintenance.
async fn housekeeping(
    engine: Arc<FileEngine>,
    config: SeConfig,
    keys: Arc<KeySet>,
    s3_backend: Option<Arc<S3Backend>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(600));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut cycles: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cycles += 1;
                if let Err(e) = engine.gc_wal().await {
                    warn!(error = %e, "wal retention sweep failed");
                }
                engine.prune_tickets();
                if let Err(e) = load_public_key(&config, &keys) {
                    warn!(error = %e, "public key reload failed");
                }
                // The S3 used counter drifts under concurrent deletes;
                // rebuild it from a listing now and then.
                if let Some(s3) = &s3_backend {
                    if cycles % 3 == 0 {
                        match s3.reconcile_used().await {
                            Ok(used) => info!(used, "s3 used counter reconciled"),
                            Err(e) => warn!(error = %e, "s3 reconcile failed"),
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
