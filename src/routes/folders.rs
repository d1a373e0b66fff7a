use axum::extract::{Json, State};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{Folder, NewFolder};
use crate::schema::{document_folders, folders};
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderResponse {
    pub id: Uuid,
    pub name: String,
    pub document_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct CreateFolderRequest {
    pub name: String,
}

pub async fn list_folders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<FolderResponse>>> {
    let mut conn = state.db()?;

    let rows: Vec<Folder> = folders::table
        .filter(folders::owner_user_id.eq(user.user_id))
        .order(folders::name.asc())
        .load(&mut conn)
        .map_err(AppError::from)?;

    let folder_ids: Vec<Uuid> = rows.iter().map(|folder| folder.id).collect();
    let assignments: Vec<(Uuid, Uuid)> = document_folders::table
        .filter(document_folders::folder_id.eq_any(&folder_ids))
        .select((document_folders::folder_id, document_folders::document_id))
        .load(&mut conn)
        .map_err(AppError::from)?;

    let response = rows
        .into_iter()
        .map(|folder| {
            let document_ids = assignments
                .iter()
                .filter(|(folder_id, _)| *folder_id == folder.id)
                .map(|(_, document_id)| *document_id)
                .collect();
            FolderResponse {
                id: folder.id,
                name: folder.name,
                document_ids,
            }
        })
        .collect();

    Ok(Json(response))
}

pub async fn create_folder(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateFolderRequest>,
) -> AppResult<Json<FolderResponse>> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::validation("folder name must not be empty"));
    }
    if name.len() > 255 {
        return Err(AppError::validation("folder name too long"));
    }

    let mut conn = state.db()?;
    let folder: Folder = diesel::insert_into(folders::table)
        .values(&NewFolder {
            id: Uuid::new_v4(),
            owner_user_id: user.user_id,
            name: name.to_string(),
        })
        .get_result(&mut conn)
        .map_err(AppError::from)?;

    Ok(Json(FolderResponse {
        id: folder.id,
        name: folder.name,
        document_ids: Vec::new(),
    }))
}
