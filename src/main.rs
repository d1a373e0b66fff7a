use std::sync::Arc;

use anyhow::{anyhow, Context};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use coderoom::{
    auth::TokenVerifier,
    config::AppConfig,
    exec::{queue::ExecutionQueue, sandbox::SandboxRunner},
    hub::registry::HubRegistry,
    routes,
    state::{self, AppState},
    storage::{ObjectStorage, S3Storage},
};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    info!(
        database_url = %config.redacted_database_url(),
        port = config.server_port,
        snapshots_enabled = config.snapshots_enabled(),
        "loaded configuration"
    );

    let pool = state::connect_pool(&config, &config.effective_database_url())?;

    // A schema the code does not understand is fatal; exit non-zero and let
    // the supervisor restart us after the operator intervenes.
    {
        let mut conn = pool.get().context("failed to acquire migration connection")?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("migrations failed: {err}"))?;
        info!("migrations up to date");
    }

    let storage: Option<Arc<dyn ObjectStorage>> = if config.snapshots_enabled() {
        Some(Arc::new(S3Storage::connect(&config).await?))
    } else {
        warn!("blob storage not configured; snapshots disabled, documents load by full replay");
        None
    };

    let verifier = Arc::new(TokenVerifier::from_config(&config)?);
    let hubs = HubRegistry::new(pool.clone(), Arc::clone(&config), storage.clone());

    let sandbox = SandboxRunner::new(Arc::clone(&config));
    if sandbox.probe().await.is_err() && !config.exec_allow_insecure_fallback {
        warn!("continuing without code execution; /api/execute will return 503");
    }

    let queue_pool = match &config.queue_url {
        Some(_) => state::connect_pool(&config, &config.effective_queue_url())?,
        None => pool.clone(),
    };
    let exec = ExecutionQueue::new(
        queue_pool,
        Arc::clone(&config),
        Arc::clone(&sandbox),
        Arc::clone(&hubs),
    );
    exec.recover_interrupted().await?;

    let state = AppState::new(
        pool,
        Arc::clone(&config),
        storage,
        verifier,
        Arc::clone(&hubs),
        Arc::clone(&exec),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&hubs).run_eviction(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&exec).run_maintenance(shutdown_rx));

    let router = routes::create_router(state);
    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("received shutdown signal");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
