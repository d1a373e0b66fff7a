use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, Pool, PooledConnection},
};

use crate::{
    auth::TokenVerifier,
    config::AppConfig,
    error::{AppError, AppResult},
    exec::queue::ExecutionQueue,
    hub::registry::HubRegistry,
    storage::ObjectStorage,
};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// Opens a bounded connection pool against `url`. Both the main database
/// and the queue backend (when `QUEUE_URL` points elsewhere) go through
/// here, sized by `PG_POOL_MAX`.
pub fn connect_pool(config: &AppConfig, url: &str) -> anyhow::Result<PgPool> {
    Pool::builder()
        .max_size(config.pg_pool_max.max(1))
        .connection_timeout(Duration::from_secs(10))
        .build(ConnectionManager::<PgConnection>::new(url))
        .context("failed to open database pool")
}

/// Process-wide context, constructed once at bootstrap and handed to every
/// component. Nothing in the crate reaches for globals.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    /// Absent when blob storage is not configured; the update log alone is
    /// then authoritative and snapshots are skipped.
    pub storage: Option<Arc<dyn ObjectStorage>>,
    pub verifier: Arc<TokenVerifier>,
    pub hubs: Arc<HubRegistry>,
    pub exec: Arc<ExecutionQueue>,
    pub started_at: Instant,
    pub active_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: Arc<AppConfig>,
        storage: Option<Arc<dyn ObjectStorage>>,
        verifier: Arc<TokenVerifier>,
        hubs: Arc<HubRegistry>,
        exec: Arc<ExecutionQueue>,
    ) -> Self {
        Self {
            pool,
            config,
            storage,
            verifier,
            hubs,
            exec,
            started_at: Instant::now(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool.get().map_err(AppError::from)
    }
}
