//! CurrentUser extractor for authenticated requests.
//!
//! Resolves the bearer credential (session token or API token) against the
//! store and provides the principal to route handlers.

use axum::{extract::FromRequestParts, http::request::Parts};

use foreman_auth::{resolve_bearer, Principal};
use foreman_domain::UserId;

use crate::{ApiError, AppState};

/// Authenticated caller context.
///
/// Use this extractor in route handlers to require authentication:
///
/// ```ignore
/// async fn protected_route(user: CurrentUser) -> impl IntoResponse {
///     format!("hello, {}", user.user_id())
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Principal);

impl CurrentUser {
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.0.user_id
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(ApiError::Unauthorized)?;

        let principal = resolve_bearer(&state.pool, &token).await.map_err(|e| {
            tracing::debug!(error = %e, "credential resolution failed");
            ApiError::Unauthorized
        })?;

        Ok(CurrentUser(principal))
    }
}

/// Pull the credential from `Authorization: Bearer ...` or a `token` query
/// parameter (the WebSocket upgrade path).
fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(header) = parts
        .headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    parts.uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .map(|t| t.to_string())
                .filter(|t| !t.is_empty())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_for(uri: &str, auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(http::header::AUTHORIZATION, auth);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_bearer_header_extracted() {
        let parts = parts_for("/runs", Some("Bearer fmn_abc"));
        assert_eq!(bearer_token(&parts).as_deref(), Some("fmn_abc"));
    }

    #[test]
    fn test_query_token_extracted() {
        let parts = parts_for("/ws?token=fmn_xyz", None);
        assert_eq!(bearer_token(&parts).as_deref(), Some("fmn_xyz"));
    }

    #[test]
    fn test_header_wins_over_query() {
        let parts = parts_for("/ws?token=fmn_query", Some("Bearer fmn_header"));
        assert_eq!(bearer_token(&parts).as_deref(), Some("fmn_header"));
    }

    #[test]
    fn test_missing_credential_is_none() {
        let parts = parts_for("/runs", None);
        assert!(bearer_token(&parts).is_none());
    }

    #[test]
    fn test_non_bearer_scheme_rejected() {
        let parts = parts_for("/runs", Some("Basic dXNlcjpwYXNz"));
        assert!(bearer_token(&parts).is_none());
    }
}
