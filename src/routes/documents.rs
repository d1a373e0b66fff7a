use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::crdt;
use crate::documents::{self, Role, ShareMode};
use crate::error::{AppError, AppResult};
use crate::models::Document;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResponse {
    pub id: Uuid,
    pub title: String,
    pub owner_user_id: Uuid,
    pub share_status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Document> for DocumentResponse {
    fn from(document: Document) -> Self {
        Self {
            id: document.id,
            title: document.title,
            owner_user_id: document.owner_user_id,
            share_status: document.share_status,
            created_at: to_rfc3339(document.created_at),
            updated_at: to_rfc3339(document.updated_at),
        }
    }
}

fn to_rfc3339(naive: chrono::NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).to_rfc3339()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDetailResponse {
    #[serde(flatten)]
    pub document: DocumentResponse,
    pub role: String,
    pub members: Vec<MemberResponse>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberResponse {
    pub user_id: Uuid,
    pub role: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    pub title: String,
    #[serde(default)]
    pub initial_content: Option<String>,
}

#[derive(Deserialize)]
pub struct RenameDocumentRequest {
    pub title: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveDocumentRequest {
    pub folder_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct ShareLinkRequest {
    pub mode: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareLinkResponse {
    pub token: String,
    pub share_status: String,
}

pub async fn list_documents(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let mut conn = state.db()?;
    let rows = documents::list_for(&mut conn, user.user_id)?;
    Ok(Json(rows.into_iter().map(DocumentResponse::from).collect()))
}

pub async fn create_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateDocumentRequest>,
) -> AppResult<Json<DocumentResponse>> {
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(AppError::validation("title must not be empty"));
    }
    if title.len() > 255 {
        return Err(AppError::validation("title too long"));
    }

    let initial_update = payload
        .initial_content
        .as_deref()
        .filter(|content| !content.is_empty())
        .map(crdt::encode_initial_content);

    let mut conn = state.db()?;
    let document = documents::create(&mut conn, user.user_id, title, initial_update)?;
    info!(document_id = %document.id, owner = %user.user_id, "document created");
    Ok(Json(DocumentResponse::from(document)))
}

pub async fn get_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentDetailResponse>> {
    let mut conn = state.db()?;

    let document = documents::find(&mut conn, document_id)
        .optional()
        .map_err(AppError::from)?
        .ok_or_else(AppError::not_found)?;
    if document.archived_at.is_some() {
        return Err(AppError::not_found());
    }

    let role = documents::role_of(&mut conn, user.user_id, document_id)?;
    if !role.can_read() {
        return Err(AppError::forbidden());
    }

    let members = documents::members_of(&mut conn, document_id)?
        .into_iter()
        .map(|(user_id, role)| MemberResponse { user_id, role })
        .collect();

    Ok(Json(DocumentDetailResponse {
        document: DocumentResponse::from(document),
        role: role.as_str().to_string(),
        members,
    }))
}

pub async fn rename_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(document_id): Path<Uuid>,
    Json(payload): Json<RenameDocumentRequest>,
) -> AppResult<Json<DocumentResponse>> {
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(AppError::validation("title must not be empty"));
    }

    let mut conn = state.db()?;
    require_owner(&mut conn, user.user_id, document_id)?;
    let document = documents::rename(&mut conn, document_id, title)?;
    Ok(Json(DocumentResponse::from(document)))
}

pub async fn archive_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(document_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    require_owner(&mut conn, user.user_id, document_id)?;
    documents::archive(&mut conn, document_id)?;
    info!(document_id = %document_id, "document archived");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn move_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(document_id): Path<Uuid>,
    Json(payload): Json<MoveDocumentRequest>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    require_owner(&mut conn, user.user_id, document_id)?;

    if let Some(folder_id) = payload.folder_id {
        let owned: bool = diesel::select(diesel::dsl::exists(
            crate::schema::folders::table
                .filter(crate::schema::folders::id.eq(folder_id))
                .filter(crate::schema::folders::owner_user_id.eq(user.user_id)),
        ))
        .get_result(&mut conn)
        .map_err(AppError::from)?;
        if !owned {
            return Err(AppError::not_found());
        }
    }

    documents::assign_folder(&mut conn, document_id, payload.folder_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn rotate_share_link(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(document_id): Path<Uuid>,
    Json(payload): Json<ShareLinkRequest>,
) -> AppResult<Json<ShareLinkResponse>> {
    let mode = match payload.mode.as_str() {
        "view" => ShareMode::View,
        "edit" => ShareMode::Edit,
        other => {
            return Err(AppError::validation(format!(
                "mode must be 'view' or 'edit', got '{other}'"
            )))
        }
    };

    let mut conn = state.db()?;
    require_owner(&mut conn, user.user_id, document_id)?;

    // The token leaves the server exactly once; only its hash is stored.
    let token = documents::rotate_share_link(&mut conn, document_id, mode)?;
    info!(document_id = %document_id, mode = payload.mode, "share link rotated");

    Ok(Json(ShareLinkResponse {
        token,
        share_status: mode.share_status().to_string(),
    }))
}

fn require_owner(
    conn: &mut diesel::PgConnection,
    user_id: Uuid,
    document_id: Uuid,
) -> AppResult<()> {
    let document = documents::find(conn, document_id)
        .optional()
        .map_err(AppError::from)?
        .ok_or_else(AppError::not_found)?;
    if document.archived_at.is_some() {
        return Err(AppError::not_found());
    }
    match documents::role_of(conn, user_id, document_id)? {
        Role::Owner => Ok(()),
        _ => Err(AppError::forbidden()),
    }
}
