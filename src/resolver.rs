//! UUID to path resolution.

use crate::catalog::CatalogSession;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Supplies the currently held catalog session, if any.
pub trait CatalogSource: Send + Sync {
    fn session(&self) -> Option<Arc<dyn CatalogSession>>;
}

impl CatalogSource for Option<Arc<dyn CatalogSession>> {
    fn session(&self) -> Option<Arc<dyn CatalogSession>> {
        self.clone()
    }
}

impl<T: CatalogSource + ?Sized> CatalogSource for Arc<T> {
    fn session(&self) -> Option<Arc<dyn CatalogSession>> {
        self.as_ref().session()
    }
}

/// Resolves entity UUIDs to catalog paths with a single metadata lookup.
pub struct PathResolver<S> {
    source: S,
    attribute: String,
}

impl<S: CatalogSource> PathResolver<S> {
    /// Creates a resolver searching on `attribute`.
    pub fn new(source: S, attribute: impl Into<String>) -> Self {
        Self {
            source,
            attribute: attribute.into(),
        }
    }

    /// Resolve an entity UUID.
    ///
    /// Only an unambiguous match resolves. No match, several matches, a
    /// lookup error or a missing session all yield `None`.
    pub async fn resolve(&self, entity_id: &str) -> Option<String> {
        let Some(session) = self.source.session() else {
            warn!(entity = %entity_id, "No catalog connection, cannot resolve entity");
            return None;
        };

        info!(entity = %entity_id, "Fetching catalog path from UUID");

        match session.search_by_attribute(&self.attribute, entity_id).await {
            Ok(mut entries) if entries.len() == 1 => entries.pop().map(|entry| entry.path),
            Ok(entries) => {
                debug!(
                    entity = %entity_id,
                    matches = entries.len(),
                    "UUID did not resolve to exactly one entry"
                );
                None
            }
            Err(e) => {
                warn!(entity = %entity_id, error = %e, "Catalog lookup failed");
                None
            }
        }
    }
}
