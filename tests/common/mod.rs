use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use coderoom::auth::TokenVerifier;
use coderoom::config::AppConfig;
use coderoom::exec::queue::ExecutionQueue;
use coderoom::exec::sandbox::SandboxRunner;
use coderoom::hub::registry::HubRegistry;
use coderoom::routes;
use coderoom::state::{self, AppState, PgPool};
use coderoom::storage::ObjectStorage;
use coderoom::users::{self, Profile};
use diesel::connection::SimpleConnection;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub const TEST_SECRET: &str = "test-secret";
pub const TEST_ISSUER: &str = "test-issuer";
pub const TEST_AUDIENCE: &str = "test-audience";

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[allow(dead_code)]
#[derive(Clone)]
pub struct StoredObject {
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<()> {
        let stored = StoredObject {
            key: key.to_string(),
            bytes,
            content_type,
        };
        let mut guard = self.objects.lock().await;
        guard.insert(stored.key.clone(), stored);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let guard = self.objects.lock().await;
        Ok(guard.get(key).map(|object| object.bytes.clone()))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.remove(key);
        Ok(())
    }
}

impl FakeStorage {
    #[allow(dead_code)]
    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        let guard = self.objects.lock().await;
        guard.get(key).cloned()
    }

    #[allow(dead_code)]
    pub async fn remove(&self, key: &str) {
        let mut guard = self.objects.lock().await;
        guard.remove(key);
    }

    #[allow(dead_code)]
    pub async fn object_count(&self) -> usize {
        let guard = self.objects.lock().await;
        guard.len()
    }
}

pub fn test_config(database_url: String) -> AppConfig {
    AppConfig {
        database_url,
        pg_pool_max: 10,
        db_ssl_mode: None,
        queue_url: None,
        server_port: 0,
        frontend_origin: None,
        blob_endpoint: None,
        blob_region: "us-east-1".to_string(),
        blob_bucket: Some("test-bucket".to_string()),
        blob_access_key_id: None,
        blob_secret_access_key: None,
        auth_jwks_url: None,
        auth_issuer: Some(TEST_ISSUER.to_string()),
        auth_audience: Some(TEST_AUDIENCE.to_string()),
        auth_shared_secret: Some(TEST_SECRET.to_string()),
        snapshot_every_n_updates: 50,
        snapshot_every_ms: 30_000,
        snapshot_keep: 3,
        prune_updates_before_snapshot: false,
        hub_idle_evict_ms: 300_000,
        exec_timeout_ms: 10_000,
        exec_code_max_bytes: 100_000,
        exec_output_max_bytes: 1_048_576,
        exec_max_concurrency: 2,
        exec_rate_limit_per_min: 10,
        worker_idle_ms: 30_000,
        exec_image_python: "python:3.12-alpine".to_string(),
        exec_image_javascript: "node:20-alpine".to_string(),
        exec_image_java: "eclipse-temurin:21-jdk-alpine".to_string(),
        exec_allow_insecure_fallback: false,
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::new_with(|_| {}).await
    }

    pub async fn new_with(customize: impl FnOnce(&mut AppConfig)) -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let mut config = test_config(database_url);
        customize(&mut config);
        let config = Arc::new(config);

        let pool = state::connect_pool(&config, &config.database_url)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let storage_dyn: Arc<dyn ObjectStorage> = storage.clone();
        let verifier = Arc::new(TokenVerifier::from_config(&config)?);
        let hubs = HubRegistry::new(pool.clone(), Arc::clone(&config), Some(storage_dyn.clone()));
        let sandbox = SandboxRunner::new(Arc::clone(&config));
        let exec = ExecutionQueue::new(
            pool.clone(),
            Arc::clone(&config),
            sandbox,
            Arc::clone(&hubs),
        );

        let state = AppState::new(
            pool,
            Arc::clone(&config),
            Some(storage_dyn),
            verifier,
            hubs,
            exec,
        );
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
        })
    }

    #[allow(dead_code)]
    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    /// Mints an HS256 token the app's verifier accepts.
    pub fn mint_token(&self, subject: &str, name: &str) -> String {
        #[derive(Serialize)]
        struct Claims<'a> {
            sub: &'a str,
            email: String,
            name: &'a str,
            iss: &'a str,
            aud: &'a str,
            exp: usize,
        }

        let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
        encode(
            &Header::default(),
            &Claims {
                sub: subject,
                email: format!("{subject}@example.com"),
                name,
                iss: TEST_ISSUER,
                aud: TEST_AUDIENCE,
                exp,
            },
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("failed to mint test token")
    }

    /// Creates (or refreshes) the identity row the way a verified request
    /// would, returning the internal user id.
    pub async fn upsert_user(&self, subject: &str, name: &str) -> Result<Uuid> {
        let subject = subject.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            let user = users::upsert_user(
                conn,
                &subject,
                Profile {
                    email: Some(format!("{subject}@example.com")),
                    name: Some(name),
                    avatar_url: None,
                },
            )
            .context("failed to upsert user")?;
            Ok(user.id)
        })
        .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::PATCH)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::DELETE).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE execution_rate_events, execution_jobs, document_updates, document_state, \
         document_folders, folders, document_members, documents, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
