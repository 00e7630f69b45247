//! Principal resolution
//!
//! Resolves a bearer credential (short-lived session token or long-lived API
//! token) to the owning user. The core only ever consumes the resolved
//! principal; issuing and revoking credentials is an external concern.

use chrono::Utc;
use sqlx::PgPool;

use foreman_domain::UserId;

use crate::error::AuthError;
use crate::tokens::hash_token;

/// How the caller authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Session,
    ApiToken,
}

/// The authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub credential: CredentialKind,
}

/// Resolve a bearer credential to a principal.
///
/// Sessions are checked first (expiry enforced), then API tokens
/// (`last_used_at` touched on hit, best-effort).
pub async fn resolve_bearer(pool: &PgPool, token: &str) -> Result<Principal, AuthError> {
    if token.is_empty() {
        return Err(AuthError::MissingCredential);
    }

    let hash = hash_token(token);

    let session = sqlx::query_as::<_, (uuid::Uuid, chrono::DateTime<Utc>)>(
        "SELECT user_id, expires_at FROM sessions WHERE token_hash = $1",
    )
    .bind(&hash)
    .fetch_optional(pool)
    .await
    .map_err(AuthError::Database)?;

    if let Some((user_id, expires_at)) = session {
        if expires_at < Utc::now() {
            return Err(AuthError::SessionExpired);
        }
        return Ok(Principal {
            user_id: UserId::from_uuid(user_id),
            credential: CredentialKind::Session,
        });
    }

    let api_user = sqlx::query_scalar::<_, uuid::Uuid>(
        "UPDATE api_tokens SET last_used_at = NOW() WHERE token_hash = $1 RETURNING user_id",
    )
    .bind(&hash)
    .fetch_optional(pool)
    .await
    .map_err(AuthError::Database)?;

    api_user.map_or(Err(AuthError::InvalidCredential), |user_id| {
        Ok(Principal {
            user_id: UserId::from_uuid(user_id),
            credential: CredentialKind::ApiToken,
        })
    })
}
