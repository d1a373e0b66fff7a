//! Durable execution queue on Postgres. Reservation uses `FOR UPDATE SKIP
//! LOCKED`, so any number of workers (in this process or another) can pull
//! jobs without double-dispatch. Workers start lazily on the first enqueue
//! and stop after an idle window; the stop decision re-checks the queue
//! inside the shutdown lock so a job enqueued mid-teardown is never
//! stranded.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use diesel::prelude::*;
use tokio::sync::{watch, Mutex};
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::hub::registry::HubRegistry;
use crate::models::{ExecutionJob, NewExecutionJob};
use crate::realtime::protocol::ServerMessage;
use crate::schema::execution_jobs;
use crate::state::PgPool;

use super::sandbox::{SandboxRunner, STATUS_COMPLETED, STATUS_FAILED, STATUS_TIMEOUT};
use super::Language;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long finished rows stay fetchable before garbage collection.
pub const RESULT_RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub owner_user_id: Uuid,
    pub document_id: Option<Uuid>,
    pub language: Language,
    pub code: String,
    pub timeout_ms: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounters {
    pub queued: i64,
    pub processing: i64,
}

struct WorkerState {
    running: bool,
    shutdown: Option<watch::Sender<bool>>,
}

pub struct ExecutionQueue {
    pool: PgPool,
    config: Arc<AppConfig>,
    sandbox: Arc<SandboxRunner>,
    hubs: Arc<HubRegistry>,
    /// The shutdown lock: worker start and stop decisions serialize here.
    workers: Mutex<WorkerState>,
    last_activity: StdMutex<Instant>,
}

impl ExecutionQueue {
    pub fn new(
        pool: PgPool,
        config: Arc<AppConfig>,
        sandbox: Arc<SandboxRunner>,
        hubs: Arc<HubRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            sandbox,
            hubs,
            workers: Mutex::new(WorkerState {
                running: false,
                shutdown: None,
            }),
            last_activity: StdMutex::new(Instant::now()),
        })
    }

    pub fn sandbox(&self) -> &Arc<SandboxRunner> {
        &self.sandbox
    }

    /// The queue's own connection pool; the rate limiter shares it so both
    /// live in the same backend.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn enqueue(self: &Arc<Self>, request: EnqueueRequest) -> AppResult<ExecutionJob> {
        let pool = self.pool.clone();
        let row = NewExecutionJob {
            id: Uuid::new_v4(),
            owner_user_id: request.owner_user_id,
            document_id: request.document_id,
            language: request.language.as_str().to_string(),
            code: request.code,
            timeout_ms: request.timeout_ms,
            status: STATUS_QUEUED.to_string(),
        };

        let job = task::spawn_blocking(move || -> AppResult<ExecutionJob> {
            let mut conn = pool.get()?;
            let job = diesel::insert_into(execution_jobs::table)
                .values(&row)
                .get_result(&mut conn)
                .map_err(AppError::from)?;
            Ok(job)
        })
        .await
        .map_err(AppError::internal)??;

        self.touch();
        self.ensure_workers().await;
        Ok(job)
    }

    /// Polls until the job reaches a terminal status or `deadline` passes.
    /// A deadline miss does not cancel the job; the result stays fetchable
    /// for the retention window.
    pub async fn wait_for_result(&self, job_id: Uuid, deadline: Duration) -> AppResult<ExecutionJob> {
        let started = Instant::now();
        loop {
            let job = self.fetch(job_id).await?.ok_or_else(AppError::not_found)?;
            if matches!(
                job.status.as_str(),
                STATUS_COMPLETED | STATUS_FAILED | STATUS_TIMEOUT
            ) {
                return Ok(job);
            }
            if started.elapsed() >= deadline {
                return Err(AppError::execution_timeout());
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    pub async fn fetch(&self, job_id: Uuid) -> AppResult<Option<ExecutionJob>> {
        let pool = self.pool.clone();
        task::spawn_blocking(move || -> AppResult<Option<ExecutionJob>> {
            let mut conn = pool.get()?;
            execution_jobs::table
                .find(job_id)
                .first(&mut conn)
                .optional()
                .map_err(AppError::from)
        })
        .await
        .map_err(AppError::internal)?
    }

    pub async fn counters(&self) -> AppResult<QueueCounters> {
        let pool = self.pool.clone();
        task::spawn_blocking(move || -> AppResult<QueueCounters> {
            let mut conn = pool.get()?;
            let queued: i64 = execution_jobs::table
                .filter(execution_jobs::status.eq(STATUS_QUEUED))
                .count()
                .get_result(&mut conn)
                .map_err(AppError::from)?;
            let processing: i64 = execution_jobs::table
                .filter(execution_jobs::status.eq(STATUS_PROCESSING))
                .count()
                .get_result(&mut conn)
                .map_err(AppError::from)?;
            Ok(QueueCounters { queued, processing })
        })
        .await
        .map_err(AppError::internal)?
    }

    /// Startup crash recovery: rows a previous process left `processing`
    /// are reported `failed` deterministically instead of vanishing.
    pub async fn recover_interrupted(&self) -> AppResult<usize> {
        let pool = self.pool.clone();
        let recovered = task::spawn_blocking(move || -> AppResult<usize> {
            let mut conn = pool.get()?;
            let count = diesel::update(
                execution_jobs::table.filter(execution_jobs::status.eq(STATUS_PROCESSING)),
            )
            .set((
                execution_jobs::status.eq(STATUS_FAILED),
                execution_jobs::failure_reason.eq(Some("interrupted")),
                execution_jobs::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)
            .map_err(AppError::from)?;
            Ok(count)
        })
        .await
        .map_err(AppError::internal)??;

        if recovered > 0 {
            warn!(recovered, "marked interrupted execution jobs as failed");
        }
        Ok(recovered)
    }

    /// Deletes terminal rows past the retention window.
    pub async fn gc_finished(&self) -> AppResult<usize> {
        let pool = self.pool.clone();
        task::spawn_blocking(move || -> AppResult<usize> {
            let cutoff = (Utc::now()
                - chrono::Duration::from_std(RESULT_RETENTION)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)))
            .naive_utc();
            let mut conn = pool.get()?;
            diesel::delete(
                execution_jobs::table
                    .filter(execution_jobs::status.eq_any([
                        STATUS_COMPLETED,
                        STATUS_FAILED,
                        STATUS_TIMEOUT,
                    ]))
                    .filter(execution_jobs::updated_at.lt(cutoff)),
            )
            .execute(&mut conn)
            .map_err(AppError::from)
        })
        .await
        .map_err(AppError::internal)?
    }

    /// Periodic housekeeping loop; exits on the shutdown signal.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    if let Err(err) = self.gc_finished().await {
                        warn!(error = %err, "execution result gc failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    async fn ensure_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if workers.running {
            return;
        }

        let (tx, rx) = watch::channel(false);
        workers.shutdown = Some(tx);
        workers.running = true;

        let concurrency = self.config.exec_max_concurrency.max(1);
        info!(concurrency, "starting execution workers");
        for index in 0..concurrency {
            let queue = Arc::clone(self);
            let shutdown = rx.clone();
            tokio::spawn(async move {
                queue.worker_loop(index, shutdown).await;
            });
        }
    }

    async fn worker_loop(self: Arc<Self>, index: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker = index, "execution worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.reserve().await {
                Ok(Some(job)) => {
                    self.touch();
                    self.process(job).await;
                    self.touch();
                }
                Ok(None) => {
                    if self.idle_for() >= Duration::from_millis(self.config.worker_idle_ms)
                        && self.try_stop().await
                    {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(WORKER_POLL_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    error!(worker = index, error = %err, "job reservation failed");
                    tokio::select! {
                        _ = tokio::time::sleep(WORKER_POLL_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!(worker = index, "execution worker stopped");
    }

    /// Idle teardown. Holding the shutdown lock, re-checks both the idle
    /// clock and the actual queue contents; a job enqueued during the check
    /// either shows up in the counts or restarts the pool via `enqueue`
    /// after this lock is released.
    async fn try_stop(self: &Arc<Self>) -> bool {
        let mut workers = self.workers.lock().await;
        if !workers.running {
            return true;
        }
        if self.idle_for() < Duration::from_millis(self.config.worker_idle_ms) {
            return false;
        }

        let counters = match self.counters().await {
            Ok(counters) => counters,
            Err(err) => {
                warn!(error = %err, "could not inspect queue before worker stop");
                return false;
            }
        };
        if counters.queued > 0 || counters.processing > 0 {
            return false;
        }

        if let Some(shutdown) = workers.shutdown.take() {
            let _ = shutdown.send(true);
        }
        workers.running = false;
        info!("execution workers idle; stopping pool");
        true
    }

    async fn reserve(&self) -> AppResult<Option<ExecutionJob>> {
        let pool = self.pool.clone();
        task::spawn_blocking(move || -> AppResult<Option<ExecutionJob>> {
            let mut conn = pool.get()?;
            conn.transaction(|conn| -> Result<Option<ExecutionJob>, diesel::result::Error> {
                let job: Option<ExecutionJob> = execution_jobs::table
                    .filter(execution_jobs::status.eq(STATUS_QUEUED))
                    .order(execution_jobs::created_at.asc())
                    .for_update()
                    .skip_locked()
                    .first(conn)
                    .optional()?;

                let Some(job) = job else {
                    return Ok(None);
                };

                diesel::update(execution_jobs::table.find(job.id))
                    .set((
                        execution_jobs::status.eq(STATUS_PROCESSING),
                        execution_jobs::updated_at.eq(Utc::now().naive_utc()),
                    ))
                    .execute(conn)?;

                Ok(Some(job))
            })
            .map_err(AppError::from)
        })
        .await
        .map_err(AppError::internal)?
    }

    async fn process(&self, job: ExecutionJob) {
        let outcome = match Language::parse(&job.language) {
            Some(language) => {
                let timeout = Duration::from_millis(job.timeout_ms.max(0) as u64);
                self.sandbox.run(job.id, language, &job.code, timeout).await
            }
            None => super::sandbox::ExecutionOutcome {
                status: STATUS_FAILED,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                elapsed_ms: 0,
                failure_reason: Some(format!("unsupported language '{}'", job.language)),
            },
        };

        info!(
            job_id = %job.id,
            status = outcome.status,
            elapsed_ms = outcome.elapsed_ms,
            "execution finished"
        );

        let pool = self.pool.clone();
        let job_id = job.id;
        let stored = task::spawn_blocking({
            let outcome = outcome.clone();
            move || -> AppResult<()> {
                let mut conn = pool.get()?;
                diesel::update(execution_jobs::table.find(job_id))
                    .set((
                        execution_jobs::status.eq(outcome.status),
                        execution_jobs::stdout.eq(Some(outcome.stdout)),
                        execution_jobs::stderr.eq(Some(outcome.stderr)),
                        execution_jobs::exit_code.eq(outcome.exit_code),
                        execution_jobs::elapsed_ms.eq(Some(outcome.elapsed_ms)),
                        execution_jobs::failure_reason.eq(outcome.failure_reason),
                        execution_jobs::updated_at.eq(Utc::now().naive_utc()),
                    ))
                    .execute(&mut conn)
                    .map_err(AppError::from)?;
                Ok(())
            }
        })
        .await;

        match stored {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(job_id = %job.id, error = %err, "failed to store execution result"),
            Err(err) => error!(job_id = %job.id, error = %err, "result storage task panicked"),
        }

        if let Some(document_id) = job.document_id {
            if let Some(hub) = self.hubs.get(document_id).await {
                hub.broadcast(ServerMessage::ExecuteResult {
                    document_id,
                    execution_id: job.id,
                    status: outcome.status.to_string(),
                    output: Some(outcome.stdout.clone()),
                    error: outcome
                        .failure_reason
                        .clone()
                        .or_else(|| (!outcome.stderr.is_empty()).then(|| outcome.stderr.clone())),
                    execution_time_ms: Some(outcome.elapsed_ms),
                })
                .await;
            }
        }
    }
}
