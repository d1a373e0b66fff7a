use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{
    Document, NewDocument, NewDocumentFolder, NewDocumentMember, NewDocumentState,
    NewDocumentUpdate,
};
use crate::schema::{document_folders, document_members, document_state, document_updates, documents};

pub const SHARE_PRIVATE: &str = "private";
pub const SHARE_RESTRICTED: &str = "restricted";
pub const SHARE_PUBLIC_VIEW: &str = "public_view";
pub const SHARE_PUBLIC_EDIT: &str = "public_edit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Editor,
    Viewer,
    None,
}

impl Role {
    pub fn can_read(self) -> bool {
        !matches!(self, Role::None)
    }

    pub fn can_edit(self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
            Role::None => "none",
        }
    }

    fn from_db(value: &str) -> Role {
        match value {
            "owner" => Role::Owner,
            "editor" => Role::Editor,
            "viewer" => Role::Viewer,
            _ => Role::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    View,
    Edit,
}

impl ShareMode {
    pub fn share_status(self) -> &'static str {
        match self {
            ShareMode::View => SHARE_PUBLIC_VIEW,
            ShareMode::Edit => SHARE_PUBLIC_EDIT,
        }
    }

    fn granted_role(self) -> Role {
        match self {
            ShareMode::View => Role::Viewer,
            ShareMode::Edit => Role::Editor,
        }
    }
}

/// Documents the user owns or is a member of, newest first, excluding
/// archived rows.
pub fn list_for(conn: &mut PgConnection, user_id: Uuid) -> QueryResult<Vec<Document>> {
    let member_doc_ids = document_members::table
        .filter(document_members::user_id.eq(user_id))
        .select(document_members::document_id);

    documents::table
        .filter(
            documents::owner_user_id
                .eq(user_id)
                .or(documents::id.eq_any(member_doc_ids)),
        )
        .filter(documents::archived_at.is_null())
        .order(documents::created_at.desc())
        .load(conn)
}

pub fn find(conn: &mut PgConnection, document_id: Uuid) -> QueryResult<Document> {
    documents::table.find(document_id).first(conn)
}

/// Creates the document, its state row, and the owner membership in one
/// transaction. When `initial_update` is present it is written as the log
/// entry with sequence 1 so a joining client immediately sees the content.
pub fn create(
    conn: &mut PgConnection,
    owner_user_id: Uuid,
    title: &str,
    initial_update: Option<Vec<u8>>,
) -> QueryResult<Document> {
    conn.transaction(|conn| {
        let new_document = NewDocument {
            id: Uuid::new_v4(),
            title: title.to_string(),
            owner_user_id,
            share_status: SHARE_PRIVATE.to_string(),
        };

        let document: Document = diesel::insert_into(documents::table)
            .values(&new_document)
            .get_result(conn)?;

        diesel::insert_into(document_state::table)
            .values(&NewDocumentState {
                document_id: document.id,
            })
            .execute(conn)?;

        diesel::insert_into(document_members::table)
            .values(&NewDocumentMember {
                document_id: document.id,
                user_id: owner_user_id,
                role: Role::Owner.as_str().to_string(),
            })
            .execute(conn)?;

        if let Some(bytes) = initial_update {
            diesel::insert_into(document_updates::table)
                .values(&NewDocumentUpdate {
                    document_id: document.id,
                    seq: 1,
                    actor_user_id: Some(owner_user_id),
                    update_bytes: bytes,
                })
                .execute(conn)?;

            diesel::update(document_state::table.find(document.id))
                .set((
                    document_state::latest_update_seq.eq(1),
                    document_state::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
        }

        Ok(document)
    })
}

pub fn role_of(conn: &mut PgConnection, user_id: Uuid, document_id: Uuid) -> QueryResult<Role> {
    let membership: Option<String> = document_members::table
        .find((document_id, user_id))
        .select(document_members::role)
        .first(conn)
        .optional()?;

    if let Some(role) = membership {
        return Ok(Role::from_db(&role));
    }

    let owner: Option<Uuid> = documents::table
        .find(document_id)
        .select(documents::owner_user_id)
        .first(conn)
        .optional()?;

    Ok(match owner {
        Some(owner_id) if owner_id == user_id => Role::Owner,
        _ => Role::None,
    })
}

/// Generates a fresh share token, stores only its hash, and returns the
/// token. The update is a single atomic write, so of two concurrent
/// rotations exactly one hash survives and the other token never resolves.
pub fn rotate_share_link(
    conn: &mut PgConnection,
    document_id: Uuid,
    mode: ShareMode,
) -> QueryResult<String> {
    let token = generate_share_token();
    let hash = hash_share_token(&token);

    diesel::update(documents::table.find(document_id))
        .set((
            documents::share_token_hash.eq(Some(hash)),
            documents::share_status.eq(mode.share_status()),
            documents::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;

    Ok(token)
}

/// Compares the hash of a presented token against the stored hash and maps
/// the document's share status to the granted role.
pub fn resolve_share_link(
    conn: &mut PgConnection,
    document_id: Uuid,
    presented: &str,
) -> QueryResult<Role> {
    let document: Option<Document> = documents::table
        .find(document_id)
        .first(conn)
        .optional()?;

    let Some(document) = document else {
        return Ok(Role::None);
    };

    let Some(stored_hash) = document.share_token_hash.as_deref() else {
        return Ok(Role::None);
    };

    let presented_hash = hash_share_token(presented);
    if !constant_time_eq(presented_hash.as_bytes(), stored_hash.as_bytes()) {
        return Ok(Role::None);
    }

    Ok(match document.share_status.as_str() {
        SHARE_PUBLIC_VIEW => ShareMode::View.granted_role(),
        SHARE_PUBLIC_EDIT => ShareMode::Edit.granted_role(),
        _ => Role::None,
    })
}

pub fn rename(conn: &mut PgConnection, document_id: Uuid, title: &str) -> QueryResult<Document> {
    diesel::update(documents::table.find(document_id))
        .set((
            documents::title.eq(title),
            documents::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result(conn)
}

pub fn archive(conn: &mut PgConnection, document_id: Uuid) -> QueryResult<()> {
    diesel::update(documents::table.find(document_id))
        .set((
            documents::archived_at.eq(Some(Utc::now().naive_utc())),
            documents::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Moves the document into `folder_id`, or out of any folder when `None`.
pub fn assign_folder(
    conn: &mut PgConnection,
    document_id: Uuid,
    folder_id: Option<Uuid>,
) -> QueryResult<()> {
    match folder_id {
        Some(folder_id) => {
            diesel::insert_into(document_folders::table)
                .values(&NewDocumentFolder {
                    document_id,
                    folder_id,
                })
                .on_conflict(document_folders::document_id)
                .do_update()
                .set((
                    document_folders::folder_id.eq(folder_id),
                    document_folders::assigned_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
        }
        None => {
            diesel::delete(
                document_folders::table.filter(document_folders::document_id.eq(document_id)),
            )
            .execute(conn)?;
        }
    }
    Ok(())
}

pub fn members_of(
    conn: &mut PgConnection,
    document_id: Uuid,
) -> QueryResult<Vec<(Uuid, String)>> {
    document_members::table
        .filter(document_members::document_id.eq(document_id))
        .select((document_members::user_id, document_members::role))
        .load(conn)
}

/// 256 bits of entropy, URL-safe. Only the SHA-256 hex digest is stored.
fn generate_share_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn hash_share_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Byte-fold comparison that does not short-circuit, so equality checks on
/// token hashes take the same time whether they diverge early or late.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_tokens_are_long_and_unique() {
        let a = generate_share_token();
        let b = generate_share_token();
        assert_ne!(a, b);
        // 32 random bytes base64url-encoded without padding.
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn hash_is_hex_sha256() {
        let hash = hash_share_token("token");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn constant_time_eq_matches_semantics() {
        assert!(constant_time_eq(b"abcdef", b"abcdef"));
        assert!(!constant_time_eq(b"abcdef", b"abcdeg"));
        assert!(!constant_time_eq(b"abc", b"abcdef"));
    }

    #[test]
    fn roles_gate_reads_and_edits() {
        assert!(Role::Owner.can_edit());
        assert!(Role::Editor.can_edit());
        assert!(!Role::Viewer.can_edit());
        assert!(Role::Viewer.can_read());
        assert!(!Role::None.can_read());
    }

    #[test]
    fn share_mode_maps_to_status_and_role() {
        assert_eq!(ShareMode::View.share_status(), SHARE_PUBLIC_VIEW);
        assert_eq!(ShareMode::Edit.share_status(), SHARE_PUBLIC_EDIT);
        assert_eq!(ShareMode::View.granted_role(), Role::Viewer);
        assert_eq!(ShareMode::Edit.granted_role(), Role::Editor);
    }
}
