use chrono::Utc;
use diesel::pg::upsert::excluded;
use diesel::prelude::*;
use diesel::PgConnection;
use uuid::Uuid;

use crate::models::{NewUser, User};
use crate::schema::users;

/// Mutable profile fields refreshed on every successful verification.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub email: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Creates or refreshes the identity record for an external `subject`.
/// Idempotent: the same subject always maps to the same internal id.
pub fn upsert_user(
    conn: &mut PgConnection,
    subject: &str,
    profile: Profile,
) -> QueryResult<User> {
    let candidate = NewUser {
        id: Uuid::new_v4(),
        subject: subject.to_string(),
        email: profile.email,
        name: profile.name,
        avatar_url: profile.avatar_url,
    };

    diesel::insert_into(users::table)
        .values(&candidate)
        .on_conflict(users::subject)
        .do_update()
        .set((
            users::email.eq(excluded(users::email)),
            users::name.eq(excluded(users::name)),
            users::avatar_url.eq(excluded(users::avatar_url)),
            users::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result(conn)
}

pub fn find_user(conn: &mut PgConnection, id: Uuid) -> QueryResult<User> {
    users::table.find(id).first(conn)
}
