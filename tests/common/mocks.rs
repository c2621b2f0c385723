//! In-memory broker and catalog doubles.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use purgeman::broker::{BrokerChannel, BrokerConnector, Delivery, DeliveryStream};
use purgeman::catalog::{CatalogConnector, CatalogEntry, CatalogSession};
use purgeman::config::{BrokerConfig, CatalogConfig};
use purgeman::events::{ChangeEvent, EventHandler};
use purgeman::{PurgemanError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// =============================================================================
// Broker
// =============================================================================

#[derive(Default)]
struct BrokerState {
    failures_left: AtomicUsize,
    connects: AtomicUsize,
    consumers: AtomicUsize,
    closes: AtomicUsize,
    declared: Mutex<Vec<String>>,
    bindings: Mutex<Vec<(String, String, String)>>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<Delivery>>>,
}

/// Broker connector backed by in-process channels.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker refusing the first `failures` connection attempts.
    pub fn failing(failures: usize) -> Self {
        let broker = Self::new();
        broker.state.failures_left.store(failures, Ordering::SeqCst);
        broker
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn consumers(&self) -> usize {
        self.state.consumers.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn declared(&self) -> Vec<String> {
        self.state.declared.lock().clone()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state.bindings.lock().clone()
    }

    /// Deliver a message to every registered consumer. Returns how many got it.
    pub fn publish(&self, routing_key: &str, body: &str) -> usize {
        let mut feeds = self.state.feeds.lock();
        feeds.retain(|feed| !feed.is_closed());
        feeds
            .iter()
            .filter(|feed| feed.send(Delivery::new(routing_key, body.as_bytes())).is_ok())
            .count()
    }

    /// End every delivery stream, as a dropped broker connection would.
    pub fn drop_consumers(&self) {
        self.state.feeds.lock().clear();
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self, _config: &BrokerConfig) -> Result<Box<dyn BrokerChannel>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(PurgemanError::Broker("connection refused".to_string()));
        }

        Ok(Box::new(MockChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockChannel {
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_queue(&self) -> Result<String> {
        let mut declared = self.state.declared.lock();
        let name = format!("amq.gen-{}", declared.len() + 1);
        declared.push(name.clone());
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.state.bindings.lock().push((
            queue.to_string(),
            exchange.to_string(),
            pattern.to_string(),
        ));
        Ok(())
    }

    async fn consume(&self, _queue: &str) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.feeds.lock().push(tx);
        self.state.consumers.fetch_add(1, Ordering::SeqCst);

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[derive(Default)]
struct CatalogState {
    failures_left: AtomicUsize,
    connects: AtomicUsize,
    releases: AtomicUsize,
    paths: Mutex<HashMap<String, Vec<String>>>,
    searches: Mutex<Vec<(String, String)>>,
}

/// Catalog connector answering metadata searches from a fixed table.
#[derive(Clone, Default)]
pub struct MockCatalog {
    state: Arc<CatalogState>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: usize) -> Self {
        let catalog = Self::new();
        catalog.state.failures_left.store(failures, Ordering::SeqCst);
        catalog
    }

    /// Register the paths a UUID resolves to.
    pub fn with_entity(self, uuid: &str, paths: &[&str]) -> Self {
        self.state.paths.lock().insert(
            uuid.to_string(),
            paths.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> Vec<(String, String)> {
        self.state.searches.lock().clone()
    }
}

#[async_trait]
impl CatalogConnector for MockCatalog {
    async fn connect(&self, _config: &CatalogConfig) -> Result<Arc<dyn CatalogSession>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(PurgemanError::Catalog("authentication failed".to_string()));
        }

        Ok(Arc::new(MockCatalogSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockCatalogSession {
    state: Arc<CatalogState>,
}

#[async_trait]
impl CatalogSession for MockCatalogSession {
    async fn search_by_attribute(&self, key: &str, value: &str) -> Result<Vec<CatalogEntry>> {
        self.state
            .searches
            .lock()
            .push((key.to_string(), value.to_string()));

        Ok(self
            .state
            .paths
            .lock()
            .get(value)
            .map(|paths| paths.iter().map(|p| CatalogEntry::new(p.clone())).collect())
            .unwrap_or_default())
    }

    async fn release(&self) {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Event handler that only records what it was given.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<ChangeEvent>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: ChangeEvent) {
        self.events.lock().push(event);
    }
}
