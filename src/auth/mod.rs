pub mod verifier;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    state::AppState,
    users::{self, Profile},
};

pub use verifier::{AuthError, TokenVerifier, VerifiedClaims};

/// Authenticated caller: token verified and identity row upserted.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub subject: String,
    pub name: Option<String>,
}

/// Verifies the bearer token and resolves (or creates) the internal user.
/// Missing header maps to 401, a rejected token to 403.
pub async fn authenticate(state: &AppState, token: &str) -> AppResult<AuthenticatedUser> {
    let claims = state
        .verifier
        .verify(token)
        .await
        .map_err(|_| AppError::forbidden())?;

    let mut conn = state.db()?;
    let user = users::upsert_user(
        &mut conn,
        &claims.subject,
        Profile {
            email: claims.email,
            name: claims.name.clone(),
            avatar_url: claims.picture,
        },
    )?;

    Ok(AuthenticatedUser {
        user_id: user.id,
        subject: user.subject,
        name: user.name,
    })
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthenticated())?;

        authenticate(state, bearer.token()).await
    }
}
