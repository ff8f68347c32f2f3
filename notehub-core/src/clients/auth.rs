//! AuthService client
//!
//! Token issuance, validation and OAuth exchange live in AuthService; this
//! client only relays. Invalid tokens come back as `Ok(None)` from
//! [`AuthClient::validate`] so callers can distinguish "bad token" from
//! "auth service down".

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::ServiceClient;
use crate::error::{Error, Result};
use crate::model::User;

/// A token/user pair minted by AuthService after a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone)]
pub struct AuthClient {
    inner: ServiceClient,
}

impl AuthClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            inner: ServiceClient::new("auth-service", base_url),
        }
    }

    /// Validate a bearer token. `Ok(None)` means the token is known-bad;
    /// transport and 5xx failures propagate as errors.
    pub async fn validate(&self, token: &str) -> Result<Option<User>> {
        match self
            .inner
            .post_json::<User, _>("/api/auth/validate", &json!({ "token": token }))
            .await
        {
            Ok(user) => Ok(Some(user)),
            Err(Error::Upstream { status: 401 | 403, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Exchange a GitHub OAuth code for a session.
    pub async fn github_auth(&self, code: &str) -> Result<AuthSession> {
        self.inner
            .post_json("/api/auth/github", &json!({ "code": code }))
            .await
    }

    /// Exchange a Google OAuth code for a session.
    pub async fn google_auth(&self, code: &str) -> Result<AuthSession> {
        self.inner
            .post_json("/api/auth/google", &json!({ "code": code }))
            .await
    }

    pub async fn send_magic_link(&self, email: &str) -> Result<()> {
        self.inner
            .post_unit("/api/auth/magic-link", &json!({ "email": email }))
            .await
    }

    /// Redeem a magic-link token for a session.
    pub async fn verify_magic_link(&self, token: &str) -> Result<AuthSession> {
        self.inner
            .post_json("/api/auth/magic-link/verify", &json!({ "token": token }))
            .await
    }

    pub async fn logout(&self, token: &str) -> Result<()> {
        self.inner
            .post_unit("/api/auth/logout", &json!({ "token": token }))
            .await
    }

    pub async fn delete_account(&self, token: &str) -> Result<()> {
        self.inner
            .post_unit("/api/auth/delete-account", &json!({ "token": token }))
            .await
    }

    pub async fn health(&self) -> Result<()> {
        self.inner.health().await
    }
}
