//! Typed HTTP clients for sibling services
//!
//! One client per service, all built on a shared transport that speaks JSON,
//! applies the 30 s default / 5 s health timeouts and translates non-2xx
//! replies into [`Error::Upstream`] carrying the status and parsed body.

mod auth;
mod compute;
mod monitor;

pub use auth::{AuthClient, AuthSession};
pub use compute::ComputeClient;
pub use monitor::MonitorClient;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared JSON-over-HTTP transport for one sibling service.
#[derive(Debug, Clone)]
pub(crate) struct ServiceClient {
    name: &'static str,
    base: String,
    http: reqwest::Client,
}

impl ServiceClient {
    pub(crate) fn new(name: &'static str, base: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            name,
            base: base.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub(crate) fn base(&self) -> &str {
        &self.base
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .map_err(|source| Error::Unreachable { service: self.name, source })?;
        self.decode(response).await
    }

    pub(crate) async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await
            .map_err(|source| Error::Unreachable { service: self.name, source })?;
        self.decode(response).await
    }

    /// POST where the caller only cares about success.
    pub(crate) async fn post_unit<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await
            .map_err(|source| Error::Unreachable { service: self.name, source })?;
        self.check(response).await?;
        Ok(())
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}{}", self.base, path))
            .send()
            .await
            .map_err(|source| Error::Unreachable { service: self.name, source })?;
        self.check(response).await?;
        Ok(())
    }

    /// 5 s health probe against the service's /health endpoint.
    pub(crate) async fn health(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/health", self.base))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|source| Error::Unreachable { service: self.name, source })?;
        self.check(response).await?;
        Ok(())
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = self.check(response).await?;
        response
            .json()
            .await
            .map_err(|e| Error::upstream(self.name, 200, format!("malformed body: {e}")))
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::upstream(self.name, status.as_u16(), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = ServiceClient::new("auth-service", "http://localhost:3001/");
        assert_eq!(client.base(), "http://localhost:3001");
    }
}
