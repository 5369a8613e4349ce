//! Broker collaborator: publish with confirms, consume, acknowledge.
//!
//! A broker routes a [`Publish`] through its topology and reports the verdict
//! to its [`ConfirmListener`] out of band. Consumers pull deliveries per
//! queue; [`Subscriptions`] maps queue names to handlers and drives them.

pub mod memory;
pub mod pgmq;

use crate::error::Result;
use crate::model::{Delivery, Envelope};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Reason attached to returns of unroutable messages (AMQP reply text).
pub const NO_ROUTE: &str = "NO_ROUTE";

/// A message addressed to an exchange under a routing key.
#[derive(Debug, Clone)]
pub struct Publish {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
    /// Ask the broker to hand the message back when no queue is bound.
    pub mandatory: bool,
}

impl Publish {
    pub fn mandatory(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        envelope: Envelope,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            envelope,
            mandatory: true,
        }
    }
}

/// Message broker as seen by dispatchers and workers.
pub trait Broker: Send + Sync + 'static {
    /// Hand a message to the broker.
    ///
    /// Fails only when the connection is unavailable. Acceptance, rejection,
    /// and returns are reported to the confirm listener afterwards.
    fn publish(&self, publish: Publish) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the next delivery on `queue`. `None` once the broker is closed.
    fn next_delivery(&self, queue: &str)
    -> impl Future<Output = Result<Option<Delivery>>> + Send;

    /// Acknowledge a delivery so it is not handed out again.
    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<()>> + Send;

    /// Create `queue` outside the topology. It is reachable through the
    /// default exchange (`""`) with its own name as routing key.
    fn declare_queue(&self, queue: &str) -> impl Future<Output = Result<()>> + Send;

    /// Remove a queue created with [`declare_queue`](Self::declare_queue),
    /// dropping whatever is still on it.
    fn delete_queue(&self, queue: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Receiver of publish-confirm signals.
///
/// For a single publish exactly one of accepted/rejected fires. A return,
/// when it happens, is reported before that confirm. Every callback gets the
/// published envelope; its `message_id` names the publish.
pub trait ConfirmListener: Send + Sync {
    fn on_accepted(&self, envelope: &Envelope);
    fn on_rejected(&self, envelope: &Envelope, reason: &str);
    fn on_returned(&self, envelope: &Envelope, reason: &str);
}

/// Confirm signal queued by a broker for later delivery to its listener.
#[derive(Debug, Clone)]
pub(crate) enum Signal {
    Accepted(Envelope),
    Rejected(Envelope, String),
    Returned(Envelope, String),
}

/// Deliver signals for one publish, in order, off the publisher's task.
pub(crate) fn emit(listener: &Arc<dyn ConfirmListener>, signals: Vec<Signal>) {
    if signals.is_empty() {
        return;
    }
    let listener = Arc::clone(listener);
    tokio::spawn(async move {
        for signal in signals {
            match signal {
                Signal::Accepted(envelope) => listener.on_accepted(&envelope),
                Signal::Rejected(envelope, reason) => listener.on_rejected(&envelope, &reason),
                Signal::Returned(envelope, reason) => listener.on_returned(&envelope, &reason),
            }
        }
    });
}

/// The accept or reject that closes out one publish.
pub(crate) fn confirm_signal(envelope: Envelope, rejected: Option<String>) -> Signal {
    match rejected {
        Some(reason) => Signal::Rejected(envelope, reason),
        None => Signal::Accepted(envelope),
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Callback invoked once per delivery on a subscribed queue.
///
/// Handlers own acknowledgement and must not fail: whatever goes wrong is
/// logged inside the handler so one bad message never stops the consumer.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn handle_delivery(&self, delivery: Delivery) -> HandlerFuture<'_>;
}

/// Stops a running [`Subscriptions`].
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Queue-name to handler mapping, run as consumer tasks.
pub struct Subscriptions<B: Broker> {
    broker: Arc<B>,
    handlers: HashMap<String, Arc<dyn DeliveryHandler>>,
    consumers_per_queue: usize,
    retry_delay: Duration,
    stop: Arc<watch::Sender<bool>>,
}

impl<B: Broker> Subscriptions<B> {
    pub fn new(broker: Arc<B>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            broker,
            handlers: HashMap::new(),
            consumers_per_queue: 1,
            retry_delay: Duration::from_secs(1),
            stop: Arc::new(tx),
        }
    }

    /// Register `handler` for every delivery on `queue`. Replaces any earlier handler.
    pub fn on(mut self, queue: impl Into<String>, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.handlers.insert(queue.into(), handler);
        self
    }

    /// Number of concurrent consumer tasks per queue.
    pub fn consumers_per_queue(mut self, n: usize) -> Self {
        self.consumers_per_queue = n.max(1);
        self
    }

    /// Pause after a failed receive before trying again.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown {
            tx: Arc::clone(&self.stop),
        }
    }

    /// Consume until shut down or the broker closes.
    pub async fn run(self) -> Result<()> {
        let mut tasks = tokio::task::JoinSet::new();
        for (queue, handler) in &self.handlers {
            for consumer in 0..self.consumers_per_queue {
                tasks.spawn(consume(
                    Arc::clone(&self.broker),
                    queue.clone(),
                    consumer,
                    Arc::clone(handler),
                    self.stop.subscribe(),
                    self.retry_delay,
                ));
            }
        }
        info!(queues = self.handlers.len(), "subscriptions started");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("consumer task ended abnormally: {e}");
            }
        }
        info!("subscriptions stopped");
        Ok(())
    }
}

async fn consume<B: Broker>(
    broker: Arc<B>,
    queue: String,
    consumer: usize,
    handler: Arc<dyn DeliveryHandler>,
    mut stop: watch::Receiver<bool>,
    retry_delay: Duration,
) {
    debug!(queue = %queue, consumer, "consumer started");
    loop {
        if *stop.borrow_and_update() {
            break;
        }
        let next = tokio::select! {
            _ = stop.changed() => break,
            next = broker.next_delivery(&queue) => next,
        };
        match next {
            Ok(Some(delivery)) => handler.handle_delivery(delivery).await,
            Ok(None) => {
                info!(queue = %queue, consumer, "broker closed, consumer exiting");
                break;
            }
            Err(e) => {
                warn!(queue = %queue, consumer, "receive failed: {e}");
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }
    debug!(queue = %queue, consumer, "consumer stopped");
}
