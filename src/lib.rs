//! purgeman - keeps HTTP cache front-ends consistent with a data catalog.
//!
//! The catalog publishes a message on a broker exchange for every change to a
//! data object or collection. purgeman listens to those messages, works out
//! the catalog path each change touched and sends an HTTP `PURGE` request for
//! that path to every configured cache front-end.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   deliveries   ┌─────────────┐  events  ┌──────────────┐
//! │  Broker  │ ─────────────▶ │ EventFilter │ ───────▶ │ PurgeHandler │
//! └──────────┘                └─────────────┘          └──────┬───────┘
//!                                   UUID lookups              │ PURGE
//!                         ┌─────────┐ ◀──────────── PathResolver ──▶ caches
//!                         │ Catalog │
//!                         └─────────┘
//! ```
//!
//! The [`service::ServiceOrchestrator`] keeps both connections alive and
//! retries them at a fixed interval. [`daemon`] implements the hand-off used
//! to run the whole thing in the background.
//!
//! # Quick Start
//!
//! ```no_run
//! use purgeman::config::ServiceConfig;
//!
//! #[tokio::main]
//! async fn main() -> purgeman::Result<()> {
//!     let config = ServiceConfig::development();
//!     purgeman::run(config, None).await
//! }
//! ```

pub mod broker;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod observability;
pub mod purge;
pub mod resolver;
pub mod service;
pub mod shutdown;

pub use config::ServiceConfig;
pub use error::{PurgemanError, Result};
pub use service::{ConnectionState, ServiceOrchestrator, ServicePhase};

use crate::broker::BrokerConnector;
use crate::catalog::HttpCatalogConnector;
use crate::daemon::{Sentinel, StartupNotifier};
use crate::shutdown::{ShutdownAware, ShutdownCoordinator, SignalHandler};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Run the purge bridge until a termination signal arrives.
///
/// `handoff` is set when running as the background child; the start-up
/// outcome is reported through it.
pub async fn run(config: ServiceConfig, handoff: Option<Arc<StartupNotifier>>) -> Result<()> {
    info!(
        broker = %config.broker.host,
        catalog = %config.catalog.host,
        caches = config.cache.url_prefixes.len(),
        "Starting purgeman"
    );

    let catalog = Arc::new(HttpCatalogConnector::new(config.cache.request_timeout)?);
    let orchestrator = ServiceOrchestrator::new(config, catalog, broker_connector()?)?;

    let coordinator = ShutdownCoordinator::new();
    let signals = SignalHandler::new(coordinator.clone());
    tokio::spawn(async move {
        if let Err(e) = signals.run().await {
            error!(error = %e, "Failed to install signal handlers");
        }
    });

    serve(orchestrator, coordinator, handoff).await
}

/// Drive `orchestrator` until it stops or `shutdown` trips.
pub async fn serve(
    orchestrator: ServiceOrchestrator,
    shutdown: ShutdownCoordinator,
    handoff: Option<Arc<StartupNotifier>>,
) -> Result<()> {
    if let Some(notifier) = &handoff {
        match orchestrator.connect().with_shutdown(&shutdown).await {
            Some(Ok(())) => {
                info!("Connected, handing off to the background");
                notifier.notify(Sentinel::Success);
                observability::silence_console();
            }
            Some(Err(e)) => {
                error!(error = %e, "Start-up failed");
                notifier.notify(Sentinel::Error);
                orchestrator.destroy().await;
                return Err(e);
            }
            None => {
                notifier.notify(Sentinel::Error);
                orchestrator.destroy().await;
                return Ok(());
            }
        }
    }

    let service = orchestrator.clone();
    let mut task = tokio::spawn(async move { service.start().await });

    tokio::select! {
        joined = &mut task => return flatten(joined),
        _ = shutdown.wait_for_shutdown() => {}
    }

    info!("Shutting down");
    if let Some(notifier) = &handoff {
        notifier.notify(Sentinel::Error);
    }
    orchestrator.destroy().await;

    match tokio::time::timeout(shutdown.timeout(), &mut task).await {
        Ok(joined) => flatten(joined),
        Err(_) => {
            warn!(timeout = ?shutdown.timeout(), "Service did not stop in time, aborting");
            task.abort();
            Ok(())
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| PurgemanError::Internal(format!("Service task failed: {}", e)))?
}

#[cfg(feature = "amqp")]
fn broker_connector() -> Result<Arc<dyn BrokerConnector>> {
    Ok(Arc::new(broker::AmqpConnector::new()))
}

#[cfg(not(feature = "amqp"))]
fn broker_connector() -> Result<Arc<dyn BrokerConnector>> {
    Err(PurgemanError::Config(
        "built without broker support, enable the `amqp` feature".to_string(),
    ))
}
