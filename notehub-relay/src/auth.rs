//! Relay-side request authorization
//!
//! Two trust paths: the `X-User-Id` header set by the orchestrator after it
//! validated the session cookie, or a bearer token validated directly
//! against AuthService (with the shared cache). Either way the
//! authenticated user must match the tenant in the path — cross-tenant
//! requests are rejected before any document or room is touched.

use axum::http::HeaderMap;
use std::collections::HashMap;
use uuid::Uuid;

use notehub_core::error::{Error, Result};

use crate::state::RelayState;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Pull a bearer token out of the Authorization header or `?token=` query.
pub fn extract_token<'a>(
    headers: &'a HeaderMap,
    query: &'a HashMap<String, String>,
) -> Option<&'a str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| query.get("token").map(String::as_str))
}

/// Authorize a request against the tenant named in the path.
pub async fn authorize(
    state: &RelayState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    path_user_id: Uuid,
) -> Result<Uuid> {
    if state.config.relay_auth_disabled() {
        return Ok(path_user_id);
    }

    // Trusted internal path: the orchestrator already validated the cookie.
    if let Some(header_uid) = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        let header_uid: Uuid = header_uid
            .parse()
            .map_err(|_| Error::Unauthorized("malformed user id header".to_string()))?;
        if header_uid == path_user_id {
            return Ok(path_user_id);
        }
        return Err(Error::Forbidden("user id mismatch".to_string()));
    }

    let token = extract_token(headers, query)
        .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;

    match state.tokens.validate(&state.auth, token).await? {
        Some(user) if user.id == path_user_id => Ok(path_user_id),
        Some(_) => Err(Error::Forbidden("user id mismatch".to_string())),
        None => Err(Error::Unauthorized("invalid token".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        let mut query = HashMap::new();
        query.insert("token".to_string(), "def".to_string());
        assert_eq!(extract_token(&headers, &query), Some("abc"));
    }

    #[test]
    fn query_token_is_accepted() {
        let headers = HeaderMap::new();
        let mut query = HashMap::new();
        query.insert("token".to_string(), "def".to_string());
        assert_eq!(extract_token(&headers, &query), Some("def"));
    }

    #[test]
    fn missing_token_is_none() {
        let headers = HeaderMap::new();
        let query = HashMap::new();
        assert_eq!(extract_token(&headers, &query), None);
    }
}
