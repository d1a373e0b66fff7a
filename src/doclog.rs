//! Append-only ordered log of CRDT update blobs, one sequence space per
//! document. The `document_state` row doubles as the monotonic counter:
//! every append locks it `FOR UPDATE`, takes the next sequence, and inserts
//! the entry in the same transaction, so concurrent appenders can never
//! observe the same sequence or a non-monotone tail.

use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{DocumentState, DocumentUpdate, NewDocumentUpdate};
use crate::schema::{document_state, document_updates};

#[derive(Debug, Error)]
pub enum DocLogError {
    #[error("document has no state row")]
    DocumentMissing,
    #[error("snapshot conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type DocLogResult<T> = Result<T, DocLogError>;

pub fn read_state(conn: &mut PgConnection, document_id: Uuid) -> DocLogResult<DocumentState> {
    document_state::table
        .find(document_id)
        .first(conn)
        .optional()?
        .ok_or(DocLogError::DocumentMissing)
}

/// Entries with sequence strictly greater than `after_seq`, ascending.
pub fn tail(
    conn: &mut PgConnection,
    document_id: Uuid,
    after_seq: i64,
) -> DocLogResult<Vec<DocumentUpdate>> {
    let entries = document_updates::table
        .filter(document_updates::document_id.eq(document_id))
        .filter(document_updates::seq.gt(after_seq))
        .order(document_updates::seq.asc())
        .load(conn)?;
    Ok(entries)
}

/// Atomically assigns the next sequence and persists the entry.
pub fn append(
    conn: &mut PgConnection,
    document_id: Uuid,
    actor_user_id: Option<Uuid>,
    update_bytes: Vec<u8>,
) -> DocLogResult<i64> {
    conn.transaction(|conn| {
        let state: Option<DocumentState> = document_state::table
            .find(document_id)
            .for_update()
            .first(conn)
            .optional()?;

        let state = state.ok_or(DocLogError::DocumentMissing)?;
        let seq = state.latest_update_seq + 1;

        diesel::insert_into(document_updates::table)
            .values(&NewDocumentUpdate {
                document_id,
                seq,
                actor_user_id,
                update_bytes,
            })
            .execute(conn)?;

        diesel::update(document_state::table.find(document_id))
            .set((
                document_state::latest_update_seq.eq(seq),
                document_state::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;

        Ok(seq)
    })
}

/// Advances the snapshot pointer to `seq` / `object_key`. Refuses to move
/// the pointer backwards or past the log head. With `prune`, entries at or
/// below the snapshot are deleted in the same transaction.
pub fn snapshot_mark(
    conn: &mut PgConnection,
    document_id: Uuid,
    seq: i64,
    object_key: &str,
    prune: bool,
) -> DocLogResult<()> {
    conn.transaction(|conn| {
        let state: Option<DocumentState> = document_state::table
            .find(document_id)
            .for_update()
            .first(conn)
            .optional()?;

        let state = state.ok_or(DocLogError::DocumentMissing)?;

        if seq > state.latest_update_seq {
            return Err(DocLogError::Conflict(format!(
                "snapshot seq {seq} beyond log head {}",
                state.latest_update_seq
            )));
        }
        if seq < state.latest_snapshot_seq {
            return Err(DocLogError::Conflict(format!(
                "snapshot pointer would move backwards ({seq} < {})",
                state.latest_snapshot_seq
            )));
        }

        diesel::update(document_state::table.find(document_id))
            .set((
                document_state::latest_snapshot_seq.eq(seq),
                document_state::latest_snapshot_key.eq(Some(object_key)),
                document_state::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;

        if prune {
            diesel::delete(
                document_updates::table
                    .filter(document_updates::document_id.eq(document_id))
                    .filter(document_updates::seq.le(seq)),
            )
            .execute(conn)?;
        }

        Ok(())
    })
}

/// Smallest sequence still present in the log, if any. Used at load time to
/// detect a pruned tail below an unreadable snapshot.
pub fn min_seq(conn: &mut PgConnection, document_id: Uuid) -> DocLogResult<Option<i64>> {
    let min: Option<i64> = document_updates::table
        .filter(document_updates::document_id.eq(document_id))
        .select(diesel::dsl::min(document_updates::seq))
        .first(conn)?;
    Ok(min)
}
