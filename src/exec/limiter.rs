//! Sliding-window rate limiter backed by Postgres. The check-and-insert is
//! one transaction serialized per (user, bucket) with an advisory lock, so
//! concurrent checks cannot slip past the limit together. Any storage
//! failure denies the request: unlimited execution during an outage is
//! worse than a refused one.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel::sql_types::Text;
use tokio::task;
use tracing::warn;
use uuid::Uuid;

use crate::models::NewRateEvent;
use crate::schema::execution_rate_events;
use crate::state::PgPool;

pub const BUCKET_EXECUTE: &str = "execute";

#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
    pub reason: Option<&'static str>,
}

impl RateDecision {
    pub fn retry_after_secs(&self) -> u64 {
        (self.reset_at - Utc::now()).num_seconds().max(1) as u64
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    pool: PgPool,
    limit: i64,
    window: ChronoDuration,
}

impl RateLimiter {
    pub fn new(pool: PgPool, limit: i64, window_secs: i64) -> Self {
        Self {
            pool,
            limit,
            window: ChronoDuration::seconds(window_secs),
        }
    }

    pub async fn check(&self, user_id: Uuid, bucket: &str) -> RateDecision {
        let pool = self.pool.clone();
        let limit = self.limit;
        let window = self.window;
        let bucket = bucket.to_string();

        let outcome = task::spawn_blocking(move || -> QueryResult<RateDecision> {
            let mut conn = pool
                .get()
                .map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            conn.transaction(|conn| check_and_insert(conn, user_id, &bucket, limit, window))
        })
        .await;

        match outcome {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => {
                warn!(error = %err, %user_id, "rate limiter storage failure; failing closed");
                self.denied("backend_unavailable")
            }
            Err(err) => {
                warn!(error = %err, %user_id, "rate limiter task failure; failing closed");
                self.denied("backend_unavailable")
            }
        }
    }

    fn denied(&self, reason: &'static str) -> RateDecision {
        RateDecision {
            allowed: false,
            remaining: 0,
            reset_at: Utc::now() + self.window,
            reason: Some(reason),
        }
    }
}

fn check_and_insert(
    conn: &mut PgConnection,
    user_id: Uuid,
    bucket: &str,
    limit: i64,
    window: ChronoDuration,
) -> QueryResult<RateDecision> {
    // Serializes concurrent checks for the same (user, bucket) for the
    // remainder of this transaction.
    diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind::<Text, _>(format!("{user_id}:{bucket}"))
        .execute(conn)?;

    let now = Utc::now();
    let cutoff = (now - window).naive_utc();

    // Events outside the window no longer count; dropping them here keeps
    // the table bounded without a separate sweeper for hot buckets.
    diesel::delete(
        execution_rate_events::table
            .filter(execution_rate_events::user_id.eq(user_id))
            .filter(execution_rate_events::bucket.eq(bucket))
            .filter(execution_rate_events::created_at.lt(cutoff)),
    )
    .execute(conn)?;

    let in_window: i64 = execution_rate_events::table
        .filter(execution_rate_events::user_id.eq(user_id))
        .filter(execution_rate_events::bucket.eq(bucket))
        .count()
        .get_result(conn)?;

    let oldest: Option<chrono::NaiveDateTime> = execution_rate_events::table
        .filter(execution_rate_events::user_id.eq(user_id))
        .filter(execution_rate_events::bucket.eq(bucket))
        .select(diesel::dsl::min(execution_rate_events::created_at))
        .first(conn)?;

    let reset_at = oldest
        .map(|earliest| DateTime::<Utc>::from_naive_utc_and_offset(earliest, Utc) + window)
        .unwrap_or(now + window);

    if in_window >= limit {
        return Ok(RateDecision {
            allowed: false,
            remaining: 0,
            reset_at,
            reason: Some("limit_exceeded"),
        });
    }

    diesel::insert_into(execution_rate_events::table)
        .values(&NewRateEvent {
            id: Uuid::new_v4(),
            user_id,
            bucket: bucket.to_string(),
        })
        .execute(conn)?;

    Ok(RateDecision {
        allowed: true,
        remaining: limit - in_window - 1,
        reset_at,
        reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_at_least_one_second() {
        let decision = RateDecision {
            allowed: false,
            remaining: 0,
            reset_at: Utc::now() - ChronoDuration::seconds(5),
            reason: Some("limit_exceeded"),
        };
        assert_eq!(decision.retry_after_secs(), 1);
    }
}
