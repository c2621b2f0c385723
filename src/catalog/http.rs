// Catalog HTTP API connector

use super::{CatalogConnector, CatalogEntry, CatalogSession};
use crate::config::CatalogConfig;
use crate::error::{PurgemanError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connector for the catalog's HTTP API gateway.
pub struct HttpCatalogConnector {
    client: Client,
}

impl HttpCatalogConnector {
    /// Creates a connector whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| PurgemanError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl CatalogConnector for HttpCatalogConnector {
    async fn connect(&self, config: &CatalogConfig) -> Result<Arc<dyn CatalogSession>> {
        info!(host = %config.host, zone = %config.zone, "Connecting to catalog");

        let session = HttpCatalogSession {
            client: self.client.clone(),
            base_url: config.api_base_url(),
            zone: config.zone.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            token: Mutex::new(None),
        };

        let token = session.authenticate().await?;
        *session.token.lock() = Some(token);

        Ok(Arc::new(session))
    }
}

/// Session holding a bearer token.
///
/// A token the API stops accepting is replaced by authenticating again with
/// the stored credentials. A released session never authenticates again.
struct HttpCatalogSession {
    client: Client,
    base_url: String,
    zone: String,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    irods_response: StatusBlock,
    #[serde(default)]
    rows: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct StatusBlock {
    status_code: i64,
    #[serde(default)]
    status_message: Option<String>,
}

impl HttpCatalogSession {
    async fn authenticate(&self) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/authenticate", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| PurgemanError::Catalog(format!("authentication request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PurgemanError::Catalog(format!(
                "authentication rejected with status {}",
                status
            )));
        }

        let token = response
            .text()
            .await
            .map_err(|e| PurgemanError::Catalog(format!("failed to read token: {}", e)))?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(PurgemanError::Catalog("empty authentication token".to_string()));
        }

        Ok(token)
    }

    fn current_token(&self) -> Result<String> {
        self.token
            .lock()
            .clone()
            .ok_or_else(|| PurgemanError::NotConnected("catalog session released".to_string()))
    }

    /// Authenticate again and swap in the new token, unless released meanwhile.
    async fn refresh_token(&self) -> Result<String> {
        let token = self.authenticate().await?;
        let mut current = self.token.lock();
        match current.as_mut() {
            Some(slot) => {
                *slot = token.clone();
                Ok(token)
            }
            None => Err(PurgemanError::NotConnected("catalog session released".to_string())),
        }
    }

    async fn send_query(&self, url: &Url, token: &str) -> Result<Response> {
        self.client
            .get(url.clone())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| PurgemanError::Catalog(format!("query request failed: {}", e)))
    }

    async fn query(&self, query: &str) -> Result<Vec<Vec<String>>> {
        let token = self.current_token()?;

        let url = Url::parse_with_params(
            &format!("{}/query", self.base_url),
            &[
                ("op", "execute_genquery"),
                ("query", query),
                ("zone", self.zone.as_str()),
            ],
        )
        .map_err(|e| PurgemanError::Config(format!("invalid catalog API URL: {}", e)))?;

        debug!(query = %query, "Running catalog query");

        let mut response = self.send_query(&url, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("Catalog token rejected, authenticating again");
            let token = self.refresh_token().await?;
            response = self.send_query(&url, &token).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(PurgemanError::Catalog(format!("query failed with status {}", status)));
        }

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| PurgemanError::Catalog(format!("malformed query response: {}", e)))?;

        if body.irods_response.status_code != 0 {
            return Err(PurgemanError::Catalog(format!(
                "query returned status {}: {}",
                body.irods_response.status_code,
                body.irods_response.status_message.unwrap_or_default()
            )));
        }

        Ok(body.rows)
    }
}

#[async_trait]
impl CatalogSession for HttpCatalogSession {
    async fn search_by_attribute(&self, key: &str, value: &str) -> Result<Vec<CatalogEntry>> {
        let (objects_query, collections_query) = metadata_queries(key, value)?;

        let mut entries: Vec<CatalogEntry> = self
            .query(&objects_query)
            .await?
            .into_iter()
            .filter_map(|row| match row.as_slice() {
                [collection, name] => Some(CatalogEntry::new(format!("{}/{}", collection, name))),
                _ => None,
            })
            .collect();

        entries.extend(
            self.query(&collections_query)
                .await?
                .into_iter()
                .filter_map(|row| row.into_iter().next().map(CatalogEntry::new)),
        );

        Ok(entries)
    }

    async fn release(&self) {
        self.token.lock().take();
    }
}

/// Build the data-object and collection metadata queries.
fn metadata_queries(key: &str, value: &str) -> Result<(String, String)> {
    if key.contains('\'') || value.contains('\'') {
        return Err(PurgemanError::InvalidInput(format!(
            "metadata search term contains a quote: {}={}",
            key, value
        )));
    }

    Ok((
        format!(
            "SELECT COLL_NAME, DATA_NAME WHERE META_DATA_ATTR_NAME = '{}' AND META_DATA_ATTR_VALUE = '{}'",
            key, value
        ),
        format!(
            "SELECT COLL_NAME WHERE META_COLL_ATTR_NAME = '{}' AND META_COLL_ATTR_VALUE = '{}'",
            key, value
        ),
    ))
}
