//! Bearer token generation and hashing
//!
//! Tokens are random 32-byte values, URL-safe base64 encoded behind a fixed
//! prefix. Only the SHA-256 hex digest is persisted; the plaintext is shown
//! once at creation time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Prefix carried by every issued API token
pub const TOKEN_PREFIX: &str = "fmn_";

/// Generate a fresh plaintext bearer token
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a plaintext token for storage and lookup
#[must_use]
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_has_prefix() {
        let token = generate_token();
        assert!(token.starts_with(TOKEN_PREFIX));
        assert!(token.len() > TOKEN_PREFIX.len() + 32);
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let hash = hash_token("fmn_example");
        assert_eq!(hash, hash_token("fmn_example"));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_tokens_hash_differently() {
        assert_ne!(hash_token("fmn_a"), hash_token("fmn_b"));
    }
}
