//! Service orchestration.
//!
//! The [`ServiceOrchestrator`] keeps two supervised loops alive: one that
//! establishes the catalog session, and one that (re)connects to the broker
//! and runs the consume loop. Connection handles and the termination flag live
//! in one state struct behind one lock; network I/O never happens while the
//! lock is held.

use crate::broker::{BrokerConnector, BrokerSession};
use crate::catalog::{CatalogConnector, CatalogSession};
use crate::config::ServiceConfig;
use crate::error::{PurgemanError, Result};
use crate::events::{ChangeEvent, EventHandler};
use crate::purge::{PurgeCredentials, PurgeDispatcher};
use crate::resolver::{CatalogSource, PathResolver};
use crate::shutdown::ShutdownCoordinator;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Lifecycle phase of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    Idle,
    Connecting,
    Running,
    Terminating,
    Terminated,
}

/// State of one external connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Terminating,
}

struct ServiceState {
    phase: ServicePhase,
    catalog_state: ConnectionState,
    broker_state: ConnectionState,
    catalog: Option<Arc<dyn CatalogSession>>,
    broker: Option<Arc<BrokerSession>>,
}

impl ServiceState {
    fn is_terminating(&self) -> bool {
        matches!(self.phase, ServicePhase::Terminating | ServicePhase::Terminated)
    }
}

struct ServiceInner {
    config: ServiceConfig,
    catalog_connector: Arc<dyn CatalogConnector>,
    broker_connector: Arc<dyn BrokerConnector>,
    dispatcher: Arc<PurgeDispatcher>,
    state: Mutex<ServiceState>,
    shutdown: ShutdownCoordinator,
}

/// Top-level lifecycle of the purge bridge.
#[derive(Clone)]
pub struct ServiceOrchestrator {
    inner: Arc<ServiceInner>,
}

impl ServiceOrchestrator {
    /// Creates an orchestrator over the given connectors.
    pub fn new(
        config: ServiceConfig,
        catalog_connector: Arc<dyn CatalogConnector>,
        broker_connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self> {
        let dispatcher = PurgeDispatcher::new(
            config.cache_targets(),
            PurgeCredentials::new(&config.catalog.username, &config.catalog.password),
            config.cache.request_timeout,
        )?;

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                catalog_connector,
                broker_connector,
                dispatcher: Arc::new(dispatcher),
                state: Mutex::new(ServiceState {
                    phase: ServicePhase::Idle,
                    catalog_state: ConnectionState::Disconnected,
                    broker_state: ConnectionState::Disconnected,
                    catalog: None,
                    broker: None,
                }),
                shutdown: ShutdownCoordinator::new(),
            }),
        })
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ServicePhase {
        self.inner.state.lock().phase
    }

    /// Catalog connection state.
    pub fn catalog_state(&self) -> ConnectionState {
        self.inner.state.lock().catalog_state
    }

    /// Broker connection state.
    pub fn broker_state(&self) -> ConnectionState {
        self.inner.state.lock().broker_state
    }

    /// Whether termination has been requested.
    pub fn is_terminating(&self) -> bool {
        self.inner.state.lock().is_terminating()
    }

    /// One connection attempt to each of catalog and broker, without retry.
    pub async fn connect(&self) -> Result<()> {
        self.inner.set_phase(ServicePhase::Connecting);
        self.inner.connect_catalog().await?;
        self.inner.connect_broker().await?;
        Ok(())
    }

    /// Run both supervised loops until they exit.
    ///
    /// Without a termination request this only returns when the broker
    /// configuration is unusable.
    pub async fn start(&self) -> Result<()> {
        if self.is_terminating() {
            return Ok(());
        }

        info!("Starting the purge service");
        self.inner.set_phase(ServicePhase::Connecting);

        let catalog_task = tokio::spawn(Arc::clone(&self.inner).supervise_catalog());
        let broker_task = tokio::spawn(Arc::clone(&self.inner).supervise_broker());

        let (catalog_result, broker_result) = tokio::join!(catalog_task, broker_task);

        if let Err(e) = catalog_result {
            error!(error = %e, "Catalog task failed");
        }

        let result = match broker_result {
            Ok(result) => result,
            Err(e) => Err(PurgemanError::Internal(format!("Broker task failed: {}", e))),
        };

        let mut state = self.inner.state.lock();
        if state.is_terminating() {
            state.phase = ServicePhase::Terminated;
        }

        result
    }

    /// Request termination and release both connections. Idempotent.
    pub async fn destroy(&self) {
        let (catalog, broker) = {
            let mut state = self.inner.state.lock();
            if state.is_terminating() {
                return;
            }
            state.phase = ServicePhase::Terminating;
            state.catalog_state = ConnectionState::Terminating;
            state.broker_state = ConnectionState::Terminating;
            (state.catalog.take(), state.broker.take())
        };

        info!("Destroying the purge service");
        self.inner.shutdown.shutdown();

        if let Some(catalog) = catalog {
            catalog.release().await;
        }

        if let Some(broker) = broker {
            broker.disconnect().await;
        }
    }
}

impl ServiceInner {
    fn is_terminating(&self) -> bool {
        self.state.lock().is_terminating()
    }

    fn set_phase(&self, phase: ServicePhase) {
        let mut state = self.state.lock();
        if !state.is_terminating() {
            state.phase = phase;
        }
    }

    async fn connect_catalog(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.is_terminating() {
                return Err(PurgemanError::Terminated);
            }
            if state.catalog.is_some() {
                return Ok(());
            }
            state.catalog_state = ConnectionState::Connecting;
        }

        info!("Connecting to catalog");
        let result = self.catalog_connector.connect(&self.config.catalog).await;
        record_attempt("catalog", result.is_ok());

        let session = {
            let mut state = self.state.lock();
            match result {
                Ok(session) if !state.is_terminating() => {
                    state.catalog = Some(session);
                    state.catalog_state = ConnectionState::Connected;
                    return Ok(());
                }
                Ok(session) => session,
                Err(e) => {
                    if !state.is_terminating() {
                        state.catalog_state = ConnectionState::Disconnected;
                    }
                    return Err(e);
                }
            }
        };

        // Terminated while connecting.
        session.release().await;
        Err(PurgemanError::Terminated)
    }

    async fn connect_broker(&self) -> Result<Arc<BrokerSession>> {
        {
            let mut state = self.state.lock();
            if state.is_terminating() {
                return Err(PurgemanError::Terminated);
            }
            if let Some(session) = &state.broker {
                return Ok(Arc::clone(session));
            }
            state.broker_state = ConnectionState::Connecting;
        }

        let result =
            BrokerSession::connect(self.broker_connector.as_ref(), &self.config.broker).await;
        record_attempt("broker", result.is_ok());

        let session = {
            let mut state = self.state.lock();
            match result {
                Ok(session) if !state.is_terminating() => {
                    let session = Arc::new(session);
                    state.broker = Some(Arc::clone(&session));
                    state.broker_state = ConnectionState::Connected;
                    return Ok(session);
                }
                Ok(session) => session,
                Err(e) => {
                    if !state.is_terminating() {
                        state.broker_state = ConnectionState::Disconnected;
                    }
                    return Err(e);
                }
            }
        };

        session.disconnect().await;
        Err(PurgemanError::Terminated)
    }

    /// Drop `session` from the state if it is still the current one, then close it.
    async fn clear_broker(&self, session: &Arc<BrokerSession>) {
        {
            let mut state = self.state.lock();
            if state
                .broker
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                state.broker = None;
                if !state.is_terminating() {
                    state.broker_state = ConnectionState::Disconnected;
                }
            }
        }
        session.disconnect().await;
    }

    async fn supervise_catalog(self: Arc<Self>) {
        loop {
            if self.is_terminating() {
                return;
            }

            match self.connect_catalog().await {
                // The session renews its own credentials from here on.
                Ok(()) => return,
                Err(PurgemanError::Terminated) => return,
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in = ?self.config.retry_interval,
                        "Failed to connect to catalog, will retry"
                    );
                }
            }

            if self.shutdown.pause(self.config.retry_interval).await {
                return;
            }
        }
    }

    async fn supervise_broker(self: Arc<Self>) -> Result<()> {
        let handler: Arc<dyn EventHandler> = Arc::new(PurgeHandler::new(
            PathResolver::new(
                Arc::clone(&self),
                self.config.catalog.uuid_attribute.clone(),
            ),
            Arc::clone(&self.dispatcher),
        ));

        loop {
            if self.is_terminating() {
                return Ok(());
            }

            let result = match self.connect_broker().await {
                Ok(session) => {
                    self.set_phase(ServicePhase::Running);
                    info!("Consuming filesystem events");

                    let result = session.consume(Arc::clone(&handler)).await;
                    self.clear_broker(&session).await;

                    if self.is_terminating() {
                        return Ok(());
                    }
                    self.set_phase(ServicePhase::Connecting);
                    result
                }
                Err(PurgemanError::Terminated) => return Ok(()),
                Err(e) => Err(e),
            };

            match result {
                Err(e) if e.is_config() => {
                    error!(error = %e, "Broker configuration is unusable");
                    // Nothing will ever succeed, so stop the catalog loop as well.
                    ServiceOrchestrator {
                        inner: Arc::clone(&self),
                    }
                    .destroy()
                    .await;
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in = ?self.config.retry_interval,
                        "Lost broker connection, will retry"
                    );
                }
                Ok(()) => {
                    warn!(retry_in = ?self.config.retry_interval, "Consume loop stopped, will reconnect");
                }
            }

            if self.shutdown.pause(self.config.retry_interval).await {
                return Ok(());
            }
        }
    }
}

impl CatalogSource for ServiceInner {
    fn session(&self) -> Option<Arc<dyn CatalogSession>> {
        let state = self.state.lock();
        if state.is_terminating() {
            return None;
        }
        state.catalog.clone()
    }
}

fn record_attempt(connection: &'static str, ok: bool) {
    let outcome = if ok { "success" } else { "failure" };
    metrics::counter!(
        "purgeman_connection_attempts_total",
        "connection" => connection,
        "outcome" => outcome
    )
    .increment(1);
}

/// Event handler that resolves paths when needed and purges them.
pub struct PurgeHandler<S> {
    resolver: PathResolver<S>,
    dispatcher: Arc<PurgeDispatcher>,
}

impl<S: CatalogSource> PurgeHandler<S> {
    pub fn new(resolver: PathResolver<S>, dispatcher: Arc<PurgeDispatcher>) -> Self {
        Self {
            resolver,
            dispatcher,
        }
    }
}

#[async_trait]
impl<S: CatalogSource + 'static> EventHandler for PurgeHandler<S> {
    async fn handle(&self, event: ChangeEvent) {
        let mut path = event.path_str().to_string();
        if path.is_empty() && !event.entity_str().is_empty() {
            path = self.resolver.resolve(event.entity_str()).await.unwrap_or_default();
        }

        if path.is_empty() {
            metrics::counter!("purgeman_events_dropped_total", "reason" => "unresolved")
                .increment(1);
            info!(
                kind = %event.kind,
                entity = %event.entity_str(),
                "Received an event on an entity that could not be resolved"
            );
            return;
        }

        info!(kind = %event.kind, path = %path, "Received an event");
        self.dispatcher.purge(&path).await;
    }
}
