//! Session authentication
//!
//! Sessions are opaque bearer tokens minted by AuthService and carried in
//! the `session_token` cookie (browsers), an `Authorization: Bearer`
//! header (API clients) or a `?token=` query parameter (WebSocket clients
//! that cannot set headers). Validation goes through the shared token
//! cache; HTML clients bounce to `/login`, API clients get 401 JSON.

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;

use notehub_core::error::Error;
use notehub_core::model::User;

use crate::state::AppState;

pub const SESSION_COOKIE: &str = "session_token";

/// Token found anywhere in a request, in precedence order.
pub fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(bearer) = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.to_string());
    }

    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        return Some(cookie.value().to_string());
    }

    query_param(parts.uri.query().unwrap_or(""), "token")
}

/// Minimal query-string lookup; the proxy paths cannot afford a full form
/// parser on every upgrade.
pub fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Does the client want an HTML answer (browser navigation) rather than
/// JSON (API / fetch)?
pub fn wants_html(parts: &Parts) -> bool {
    parts
        .headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
}

/// An authenticated request: the validated user plus the raw token, which
/// downstream proxies re-attach.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user: User,
    pub token: String,
}

pub enum AuthRejection {
    /// Browser: redirect to the login page.
    Login,
    /// API caller: 401 JSON.
    Unauthorized(Error),
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            Self::Login => Redirect::to("/login").into_response(),
            Self::Unauthorized(error) => error.into_response(),
        }
    }
}

impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let html = wants_html(parts);
        let reject = |error: Error| {
            if html {
                AuthRejection::Login
            } else {
                AuthRejection::Unauthorized(error)
            }
        };

        let token = token_from_parts(parts)
            .ok_or_else(|| reject(Error::Unauthorized("no session".to_string())))?;

        match state.tokens.validate(&state.auth, &token).await {
            Ok(Some(user)) => Ok(AuthedUser { user, token }),
            Ok(None) => Err(reject(Error::Unauthorized("invalid session".to_string()))),
            Err(e) => {
                tracing::error!(error = %e, "auth service validation failed");
                Err(AuthRejection::Unauthorized(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_for(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn bearer_beats_cookie_and_query() {
        let parts = parts_for(
            "/u/x?token=querytok",
            &[
                ("authorization", "Bearer headertok"),
                ("cookie", "session_token=cookietok"),
            ],
        );
        assert_eq!(token_from_parts(&parts).as_deref(), Some("headertok"));
    }

    #[test]
    fn cookie_beats_query() {
        let parts = parts_for("/u/x?token=querytok", &[("cookie", "session_token=cookietok")]);
        assert_eq!(token_from_parts(&parts).as_deref(), Some("cookietok"));
    }

    #[test]
    fn query_token_last_resort() {
        let parts = parts_for("/u/x?a=1&token=querytok", &[]);
        assert_eq!(token_from_parts(&parts).as_deref(), Some("querytok"));
    }

    #[test]
    fn html_detection() {
        let parts = parts_for("/dashboard", &[("accept", "text/html,application/xhtml+xml")]);
        assert!(wants_html(&parts));
        let parts = parts_for("/api/x", &[("accept", "application/json")]);
        assert!(!wants_html(&parts));
        let parts = parts_for("/api/x", &[]);
        assert!(!wants_html(&parts));
    }
}
