//! Cache purge dispatch.
//!
//! Every resolved path is purged on all configured cache front-ends at once.
//! Each front-end is independent: one failing target never stops the others,
//! and nothing is retried.

use crate::error::{PurgemanError, Result};
use reqwest::header::HOST;
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// HTTP verb understood by the cache layer as "evict this object".
pub const PURGE_METHOD: &str = "PURGE";

/// One cache front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTarget {
    /// URL prefix the catalog path is appended to.
    pub url_prefix: String,
    /// Host header to send instead of the one derived from the URL.
    pub host_override: Option<String>,
}

impl CacheTarget {
    /// Creates a target.
    pub fn new(url_prefix: impl Into<String>, host_override: Option<String>) -> Self {
        Self {
            url_prefix: url_prefix.into(),
            host_override,
        }
    }

    /// Request URL for `path`: the prefix without trailing slashes, then the path.
    pub fn request_url(&self, path: &str) -> String {
        format!("{}{}", self.url_prefix.trim_end_matches('/'), path)
    }

    /// Host header value for a request to `request_url`.
    pub fn host_header(&self, request_url: &str) -> Result<String> {
        if let Some(host) = self.host_override.as_deref().filter(|h| !h.is_empty()) {
            return Ok(host.to_string());
        }

        let url = Url::parse(request_url)
            .map_err(|e| PurgemanError::Purge(format!("invalid URL '{}': {}", request_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| PurgemanError::Purge(format!("URL '{}' has no host", request_url)))?;

        Ok(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }
}

/// Identity presented to the cache layer.
#[derive(Clone)]
pub struct PurgeCredentials {
    pub username: String,
    pub password: String,
}

impl PurgeCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for PurgeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurgeCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Outcome of purging one path on every target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl PurgeReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.succeeded == self.attempted
    }
}

/// Issues purge requests to every cache target concurrently.
pub struct PurgeDispatcher {
    client: Client,
    method: Method,
    targets: Arc<[CacheTarget]>,
    credentials: PurgeCredentials,
}

impl PurgeDispatcher {
    /// Creates a dispatcher whose requests time out after `timeout`.
    pub fn new(
        targets: Vec<CacheTarget>,
        credentials: PurgeCredentials,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| PurgemanError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let method = Method::from_bytes(PURGE_METHOD.as_bytes())
            .map_err(|e| PurgemanError::Internal(format!("Invalid purge method: {}", e)))?;

        Ok(Self {
            client,
            method,
            targets: targets.into(),
            credentials,
        })
    }

    /// Configured targets.
    pub fn targets(&self) -> &[CacheTarget] {
        &self.targets
    }

    /// Purge `path` on every target. Returns once every request has finished.
    pub async fn purge(&self, path: &str) -> PurgeReport {
        info!(path = %path, targets = self.targets.len(), "Purging cache");

        let mut tasks = JoinSet::new();
        for target in self.targets.iter().cloned() {
            let client = self.client.clone();
            let method = self.method.clone();
            let credentials = self.credentials.clone();
            let path = path.to_string();

            tasks.spawn(async move {
                let result = purge_target(&client, method, &credentials, &target, &path).await;
                if let Err(e) = &result {
                    error!(prefix = %target.url_prefix, path = %path, error = %e, "Purge failed");
                }
                result
            });
        }

        let mut report = PurgeReport {
            attempted: self.targets.len(),
            ..PurgeReport::default()
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {
                    report.succeeded += 1;
                    metrics::counter!("purgeman_purge_requests_total", "outcome" => "success")
                        .increment(1);
                }
                Ok(Err(_)) => {
                    report.failed += 1;
                    metrics::counter!("purgeman_purge_requests_total", "outcome" => "failure")
                        .increment(1);
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "Purge task panicked");
                }
            }
        }

        debug!(path = %path, ?report, "Purge finished");
        report
    }
}

async fn purge_target(
    client: &Client,
    method: Method,
    credentials: &PurgeCredentials,
    target: &CacheTarget,
    path: &str,
) -> Result<()> {
    let request_url = target.request_url(path);
    let host = target.host_header(&request_url)?;

    info!(url = %request_url, host = %host, "Sending a PURGE request");

    let mut request = client
        .request(method, &request_url)
        .basic_auth(&credentials.username, Some(&credentials.password));

    if let Some(host_override) = target.host_override.as_deref().filter(|h| !h.is_empty()) {
        request = request.header(HOST, host_override);
    }

    let response = request.send().await.map_err(|e| {
        PurgemanError::Purge(format!("request to '{}' for host '{}' failed: {}", request_url, host, e))
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(PurgemanError::Purge(format!(
            "unexpected response from '{}' for host '{}': {}",
            request_url, host, status
        )));
    }

    Ok(())
}
