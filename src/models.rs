use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = documents)]
#[diesel(belongs_to(User, foreign_key = owner_user_id))]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub owner_user_id: Uuid,
    pub share_status: String,
    pub share_token_hash: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub archived_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub title: String,
    pub owner_user_id: Uuid,
    pub share_status: String,
}

#[derive(Debug, Clone, Queryable, Associations)]
#[diesel(table_name = document_members)]
#[diesel(belongs_to(Document))]
#[diesel(belongs_to(User))]
#[diesel(primary_key(document_id, user_id))]
pub struct DocumentMember {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_members)]
pub struct NewDocumentMember {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = document_state)]
#[diesel(primary_key(document_id))]
pub struct DocumentState {
    pub document_id: Uuid,
    pub latest_snapshot_seq: i64,
    pub latest_snapshot_key: Option<String>,
    pub latest_update_seq: i64,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_state)]
pub struct NewDocumentState {
    pub document_id: Uuid,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = document_updates)]
pub struct DocumentUpdate {
    pub document_id: Uuid,
    pub seq: i64,
    pub actor_user_id: Option<Uuid>,
    pub update_bytes: Vec<u8>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_updates)]
pub struct NewDocumentUpdate {
    pub document_id: Uuid,
    pub seq: i64,
    pub actor_user_id: Option<Uuid>,
    pub update_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = folders)]
pub struct Folder {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub name: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = folders)]
pub struct NewFolder {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = document_folders)]
pub struct DocumentFolder {
    pub document_id: Uuid,
    pub folder_id: Uuid,
    pub assigned_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_folders)]
pub struct NewDocumentFolder {
    pub document_id: Uuid,
    pub folder_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = execution_jobs)]
pub struct ExecutionJob {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub document_id: Option<Uuid>,
    pub language: String,
    pub code: String,
    pub timeout_ms: i32,
    pub status: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub elapsed_ms: Option<i64>,
    pub failure_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = execution_jobs)]
pub struct NewExecutionJob {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub document_id: Option<Uuid>,
    pub language: String,
    pub code: String,
    pub timeout_ms: i32,
    pub status: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = execution_rate_events)]
pub struct NewRateEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bucket: String,
}
