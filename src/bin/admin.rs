//! Admin service entry point.
//!
//! Bootstraps identity stores and the signing-key set, seeds the initial
//! identities on first start, then runs the HTTP surface with the
//! background loops (element sync, key rotation, garbage collection)
//! until a shutdown signal lands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use artstore::admin::admin_users::{AdminRole, AdminUserStore};
use artstore::admin::elements::{ElementStore, ElementSync, SeClient};
use artstore::admin::gc::{FileRegistry, GarbageCollector};
use artstore::admin::keys::{KeyRotator, KeySet, KeyStore};
use artstore::admin::scheduler::{BackgroundJob, JobSchedule, Scheduler};
use artstore::admin::service_accounts::{SaRole, ServiceAccountStore};
use artstore::admin::tokens::{PrincipalType, TokenService, TokenSubject};
use artstore::api::admin_handlers::AdminState;
use artstore::api::admin_routes;
use artstore::api::middleware::AuthState;
use artstore::core::config::AdminConfig;
use artstore::core::error::EngineResult;
use artstore::registry::client::RegistryClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = Arc::new(AdminConfig::from_env());
    info!(addr = %config.listen_addr, "admin service starting");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("database connect")?;

    // Stores.
    let accounts = ServiceAccountStore::new(pool.clone());
    accounts.ensure_schema().await.context("accounts schema")?;
    let users = AdminUserStore::new(pool.clone());
    users.ensure_schema().await.context("users schema")?;
    let elements = ElementStore::new(pool.clone());
    elements.ensure_schema().await.context("elements schema")?;
    let file_registry = FileRegistry::new(pool.clone());
    file_registry.ensure_schema().await.context("registry schema")?;

    // Redis: registry reads plus the rotation lock.
    let registry = RegistryClient::connect(&config.redis_url)
        .await
        .context("redis connect")?;
    let redis_client = redis::Client::open(config.redis_url.as_str()).context("redis client")?;
    let redis_manager = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("redis manager")?;

    // Signing keys.
    let keys = Arc::new(KeySet::default());
    let key_store = KeyStore::new(pool.clone());
    let rotator = Arc::new(KeyRotator::new(
        key_store.clone(),
        keys.clone(),
        redis_manager,
        config.key_rotation_interval,
        config.key_rotation_interval, // deletion deferred one extra interval
    ));
    rotator.bootstrap().await.context("key bootstrap")?;

    let tokens = Arc::new(TokenService::new(
        keys.clone(),
        config.access_token_expire,
        config.refresh_token_expire,
        config.clock_skew,
    ));

    seed_identities(&config, &users, &accounts).await?;

    // Fleet sync and GC.
    let se_client = SeClient::new(Duration::from_secs(10));
    let sync = Arc::new(ElementSync::new(
        elements.clone(),
        se_client.clone(),
        registry.clone(),
        config.se_sync_interval,
        config.se_offline_threshold,
    ));

    let gc_tokens = tokens.clone();
    let gc = Arc::new(GarbageCollector::new(
        file_registry,
        elements.clone(),
        se_client.clone(),
        config.gc_finalized_margin,
        config.gc_orphan_margin,
        Box::new(move || {
            // Short-lived machine credential minted per cycle.
            let pair = gc_tokens.issue_pair(&TokenSubject {
                sub: "gc-internal".into(),
                principal_type: PrincipalType::ServiceAccount,
                role: "ADMIN".into(),
                client_id: None,
                name: Some("gc-internal".into()),
                rate_limit: None,
            })?;
            Ok(pair.access_token)
        }),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background loops.
    let sync_loop = {
        let sync = sync.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { sync.run(rx).await })
    };

    let mut scheduler = Scheduler::new();
    scheduler.spawn(
        Arc::new(GcJob { gc: gc.clone() }),
        JobSchedule::Interval(config.gc_interval),
        shutdown_rx.clone(),
    );
    scheduler.spawn(
        Arc::new(RotationJob {
            rotator: rotator.clone(),
        }),
        JobSchedule::Interval(config.key_rotation_interval),
        shutdown_rx.clone(),
    );
    scheduler.spawn(
        Arc::new(TokenPruneJob {
            tokens: tokens.clone(),
        }),
        JobSchedule::Interval(Duration::from_secs(3600)),
        shutdown_rx.clone(),
    );

    let state = AdminState {
        config: config.clone(),
        pool,
        tokens: tokens.clone(),
        keys,
        key_store,
        rotator,
        accounts,
        users,
        elements,
        sync,
        se_client,
        registry,
    };
    let router = admin_routes::create_router(state, AuthState { tokens });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "admin service listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    shutdown_tx.send(true).ok();
    scheduler.join_all().await;
    let _ = sync_loop.await;
    info!("admin service stopped");
    Ok(())
}

/// Seed the initial super-admin and service account from the environment
/// on first start.
async fn seed_identities(
    config: &AdminConfig,
    users: &AdminUserStore,
    accounts: &ServiceAccountStore,
) -> anyhow::Result<()> {
    if let (Some(username), Some(password)) = (
        config.initial_admin_username.as_deref(),
        config.initial_admin_password.as_deref(),
    ) {
        if users.find_by_username(username).await?.is_none() {
            let email = config
                .initial_admin_email
                .clone()
                .unwrap_or_else(|| format!("{username}@localhost"));
            users
                .create(username, &email, password, AdminRole::SuperAdmin, true)
                .await
                .context("seed admin user")?;
            info!(username, "initial admin user created");
        }
    }
    if let Some(name) = config.initial_account_name.as_deref() {
        let existing = accounts
            .list()
            .await?
            .into_iter()
            .any(|a| a.name == name);
        if !existing {
            let (account, secret) = accounts
                .create(
                    &config.environment,
                    name,
                    SaRole::Admin,
                    1000,
                    true,
                    config.initial_account_secret.as_deref(),
                )
                .await
                .context("seed service account")?;
            // The operator retrieves the generated secret from the log on
            // first boot unless one was provided out of band.
            if config.initial_account_secret.is_none() {
                info!(
                    client_id = %account.client_id,
                    client_secret = %secret,
                    "initial service account created"
                );
            } else {
                info!(client_id = %account.client_id, "initial service account created");
            }
        }
    }
    Ok(())
}

struct GcJob {
    gc: Arc<GarbageCollector>,
}

#[async_trait]
impl BackgroundJob for GcJob {
    fn name(&self) -> &str {
        "garbage-collector"
    }

    async fn run(&self) -> EngineResult<()> {
        self.gc.run_cycle().await.map(|_| ())
    }
}

struct RotationJob {
    rotator: Arc<KeyRotator>,
}

#[async_trait]
impl BackgroundJob for RotationJob {
    fn name(&self) -> &str {
        "key-rotation"
    }

    async fn run(&self) -> EngineResult<()> {
        match self.rotator.rotate().await {
            Ok(_) => Ok(()),
            // Another instance rotated first; its key serves us too.
            Err(e) if matches!(e.kind(), artstore::core::error::ErrorKind::RebuildInProgress) => {
                warn!("scheduled rotation lost the lock; skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

struct TokenPruneJob {
    tokens: Arc<TokenService>,
}

#[async_trait]
impl BackgroundJob for TokenPruneJob {
    fn name(&self) -> &str {
        "token-prune"
    }

    async fn run(&self) -> EngineResult<()> {
        self.tokens.prune_consumed();
        Ok(())
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
