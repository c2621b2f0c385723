//! Message broker session.
//!
//! A [`BrokerSession`] owns one broker connection and one channel on it. It
//! resolves the queue to read from, registers a consumer and feeds every
//! delivery through the [`EventFilter`]. Reconnecting is not its job: when the
//! delivery stream dies the session reports an error and the orchestrator
//! decides what happens next.

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;

use crate::config::BrokerConfig;
use crate::error::{PurgemanError, Result};
use crate::events::{ChangeEvent, EventFilter, EventHandler};
use crate::shutdown::ShutdownAware;
use crate::shutdown::ShutdownCoordinator;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Binding pattern matching every routing key.
pub const CATCH_ALL_BINDING: &str = "#";

/// One message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }
}

/// Stream of deliveries for one consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Dials the broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Open a connection and a channel on it.
    async fn connect(&self, config: &BrokerConfig) -> Result<Box<dyn BrokerChannel>>;
}

/// A channel together with the connection that carries it.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a server-named, non-durable, auto-delete queue and return its name.
    async fn declare_queue(&self) -> Result<String>;

    /// Bind `queue` to `exchange` with `pattern`.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Register an auto-ack, non-exclusive consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Close the channel, then the connection.
    async fn close(&self);
}

/// Owns one broker connection and runs the consume loop on it.
pub struct BrokerSession {
    config: BrokerConfig,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    monitoring: AtomicBool,
    stop: ShutdownCoordinator,
    filter: EventFilter,
}

impl BrokerSession {
    /// Connect to the broker.
    pub async fn connect(connector: &dyn BrokerConnector, config: &BrokerConfig) -> Result<Self> {
        info!(host = %config.host, port = config.port, vhost = %config.vhost, "Connecting to broker");
        let channel = connector.connect(config).await?;
        Ok(Self::from_channel(config.clone(), Arc::from(channel)))
    }

    /// Wrap an already open channel.
    pub fn from_channel(config: BrokerConfig, channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            config,
            channel: Mutex::new(Some(channel)),
            monitoring: AtomicBool::new(true),
            stop: ShutdownCoordinator::new(),
            filter: EventFilter::new(),
        }
    }

    /// Whether the consume loop should keep going.
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    /// Whether the channel is still held.
    pub fn is_connected(&self) -> bool {
        self.channel.lock().is_some()
    }

    /// Queue to consume from, declaring and binding a private one if needed.
    async fn resolve_queue(&self, channel: &dyn BrokerChannel) -> Result<String> {
        if !self.config.queue.is_empty() {
            return Ok(self.config.queue.clone());
        }

        if self.config.exchange.is_empty() {
            return Err(PurgemanError::Config(
                "no broker queue or exchange given".to_string(),
            ));
        }

        let queue = channel.declare_queue().await?;
        channel
            .bind_queue(&queue, &self.config.exchange, CATCH_ALL_BINDING)
            .await?;

        info!(queue = %queue, exchange = %self.config.exchange, "Bound private queue to exchange");
        Ok(queue)
    }

    /// Consume filesystem events until the session stops or fails.
    ///
    /// Each delivery's events are handed to `handler` on a task of their own,
    /// so a slow handler never stalls the feed. Returns `Ok` only when
    /// [`BrokerSession::disconnect`] stopped the loop.
    pub async fn consume(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or_else(|| PurgemanError::NotConnected("broker session is closed".to_string()))?;

        let queue = self.resolve_queue(channel.as_ref()).await?;

        while self.is_monitoring() {
            let mut deliveries = channel.consume(&queue).await.map_err(|e| {
                warn!(queue = %queue, error = %e, "Failed to register a consumer");
                e
            })?;
            debug!(queue = %queue, "Consumer registered");

            let mut delivered = 0usize;
            while let Some(next) = deliveries.next().with_shutdown(&self.stop).await {
                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => return Err(e),
                    None => break,
                };
                delivered += 1;

                let events = self.filter.filter(&delivery.routing_key, &delivery.body);
                if events.is_empty() {
                    continue;
                }

                count_received(&events);

                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    for event in events {
                        handler.handle(event).await;
                    }
                });
            }

            if self.stop.is_shutting_down() {
                return Ok(());
            }

            // A consumer that ends without a single delivery sits on a dead channel.
            if delivered == 0 {
                return Err(PurgemanError::Broker("delivery stream closed".to_string()));
            }
            debug!(queue = %queue, delivered, "Delivery stream ended, registering a new consumer");
        }

        if self.stop.is_shutting_down() {
            Ok(())
        } else {
            Err(PurgemanError::Broker("delivery stream closed".to_string()))
        }
    }

    /// Stop consuming and close the channel and connection. Idempotent.
    pub async fn disconnect(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
        self.stop.shutdown();

        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            info!("Disconnecting from broker");
            channel.close().await;
        }
    }
}

fn count_received(events: &[ChangeEvent]) {
    for event in events {
        metrics::counter!("purgeman_events_received_total", "kind" => event.kind.routing_key())
            .increment(1);
    }
}
