//! Authentication errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or malformed credential")]
    MissingCredential,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("session expired")]
    SessionExpired,

    #[error("database error")]
    Database(#[source] sqlx::Error),
}
