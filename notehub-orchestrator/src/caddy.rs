//! Caddy admin-API route loading
//!
//! At boot the orchestrator pushes a declarative route table to the edge
//! proxy: the publish host goes to the publish service, everything on the
//! platform host comes here. Per-user routes are never registered — the
//! orchestrator self-proxies `/u/*`. A missing or failing admin API is
//! logged and ignored (dev setups run without an edge).

use serde_json::json;
use std::time::Duration;

use notehub_core::Config;

pub struct CaddyAdmin {
    admin_url: String,
    http: reqwest::Client,
}

impl CaddyAdmin {
    pub fn new(admin_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            admin_url: admin_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Best-effort route load; never fatal.
    pub async fn load_routes(&self, config: &Config) {
        let payload = build_route_table(config);
        let url = format!("{}/load", self.admin_url);

        match self.http.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!("caddy routes loaded");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(%status, body, "caddy rejected route table");
            }
            Err(e) => {
                tracing::warn!(error = %e, "caddy admin unreachable, continuing without edge");
            }
        }
    }
}

/// The full config document POSTed to `/load`.
fn build_route_table(config: &Config) -> serde_json::Value {
    let domain = &config.domain;
    let publish_host = format!("publish.{domain}");
    let orchestrator = format!("localhost:{}", config.port);
    let publish_upstream = config
        .publish_service_url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .to_string();

    json!({
        "apps": {
            "http": {
                "servers": {
                    "notehub": {
                        "listen": [":443"],
                        "routes": [
                            {
                                "match": [{ "host": [publish_host] }],
                                "handle": [{
                                    "handler": "reverse_proxy",
                                    "upstreams": [{ "dial": publish_upstream }]
                                }]
                            },
                            {
                                "match": [{ "host": [domain] }],
                                "handle": [{
                                    "handler": "reverse_proxy",
                                    "upstreams": [{ "dial": orchestrator }]
                                }]
                            }
                        ]
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_table_has_both_hosts() {
        let mut config = Config::default();
        config.domain = "notehub.dev".to_string();
        config.port = 3000;

        let table = build_route_table(&config);
        let routes = &table["apps"]["http"]["servers"]["notehub"]["routes"];
        assert_eq!(routes[0]["match"][0]["host"][0], "publish.notehub.dev");
        assert_eq!(routes[1]["match"][0]["host"][0], "notehub.dev");
        assert_eq!(
            routes[1]["handle"][0]["upstreams"][0]["dial"],
            "localhost:3000"
        );
    }
}
