//! Thin authentication gate for Foreman
//!
//! Resolves bearer credentials to principals. Everything else about identity
//! (issuing sessions, user management) lives outside the core.

pub mod error;
pub mod principal;
pub mod tokens;

pub use error::AuthError;
pub use principal::{resolve_bearer, CredentialKind, Principal};
pub use tokens::{generate_token, hash_token, TOKEN_PREFIX};
