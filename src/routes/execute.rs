use std::time::Duration;

use axum::extract::{Json, Path, State};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::documents;
use crate::error::{AppError, AppResult};
use crate::exec::limiter::{RateLimiter, BUCKET_EXECUTE};
use crate::exec::queue::EnqueueRequest;
use crate::exec::validate_request;
use crate::models::ExecutionJob;
use crate::state::AppState;

/// Slack on top of the job's own timeout before the HTTP caller gives up;
/// the job itself is bounded by the sandbox either way.
const RESULT_WAIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub document_id: Option<Uuid>,
    pub language: String,
    pub code: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub execution_id: Uuid,
    pub status: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: Option<i64>,
}

impl From<ExecutionJob> for ExecuteResponse {
    fn from(job: ExecutionJob) -> Self {
        Self {
            execution_id: job.id,
            status: job.status,
            output: job.stdout,
            error: job
                .failure_reason
                .or_else(|| job.stderr.filter(|stderr| !stderr.is_empty())),
            execution_time_ms: job.elapsed_ms,
        }
    }
}

pub async fn execute(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<ExecuteRequest>,
) -> AppResult<Json<ExecuteResponse>> {
    let language = validate_request(&state.config, &payload.language, &payload.code)?;

    if let Some(document_id) = payload.document_id {
        let mut conn = state.db()?;
        let role = documents::role_of(&mut conn, user.user_id, document_id)?;
        if !role.can_read() {
            return Err(AppError::forbidden());
        }
    }

    if !state.exec.sandbox().is_available() {
        return Err(AppError::sandbox_unavailable());
    }

    let limiter = RateLimiter::new(
        state.exec.pool().clone(),
        state.config.exec_rate_limit_per_min,
        60,
    );
    let decision = limiter.check(user.user_id, BUCKET_EXECUTE).await;
    if !decision.allowed {
        info!(
            user_id = %user.user_id,
            reason = decision.reason.unwrap_or("unknown"),
            "execution request rate limited"
        );
        return Err(AppError::rate_limited(decision.retry_after_secs()));
    }

    let timeout_ms = state.config.exec_timeout_ms.min(i32::MAX as u64) as i32;
    let job = state
        .exec
        .enqueue(EnqueueRequest {
            owner_user_id: user.user_id,
            document_id: payload.document_id,
            language,
            code: payload.code,
            timeout_ms,
        })
        .await?;

    info!(execution_id = %job.id, user_id = %user.user_id, language = language.as_str(), "execution enqueued");

    let deadline = Duration::from_millis(timeout_ms as u64) + RESULT_WAIT_GRACE;
    let finished = state.exec.wait_for_result(job.id, deadline).await?;
    Ok(Json(ExecuteResponse::from(finished)))
}

pub async fn get_execution(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(execution_id): Path<Uuid>,
) -> AppResult<Json<ExecuteResponse>> {
    let job = state
        .exec
        .fetch(execution_id)
        .await?
        .ok_or_else(AppError::not_found)?;
    if job.owner_user_id != user.user_id {
        return Err(AppError::forbidden());
    }
    Ok(Json(ExecuteResponse::from(job)))
}
