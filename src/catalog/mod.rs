//! Catalog access.
//!
//! The catalog is an external metadata service. This crate only needs two
//! things from it: a session, and an attribute search that maps an entity
//! UUID back to its path.

pub mod http;

pub use http::HttpCatalogConnector;

use crate::config::CatalogConfig;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One entry returned by a metadata search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Absolute catalog path of the data object or collection.
    pub path: String,
}

impl CatalogEntry {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Opens catalog sessions.
#[async_trait]
pub trait CatalogConnector: Send + Sync + 'static {
    /// Connect and authenticate.
    async fn connect(&self, config: &CatalogConfig) -> Result<Arc<dyn CatalogSession>>;
}

/// An authenticated catalog session.
///
/// Sessions renew their own credentials once established.
#[async_trait]
pub trait CatalogSession: Send + Sync {
    /// Every entry whose metadata attribute `key` equals `value`.
    async fn search_by_attribute(&self, key: &str, value: &str) -> Result<Vec<CatalogEntry>>;

    /// Release server-side resources held by the session.
    async fn release(&self);
}
