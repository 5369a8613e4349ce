//! In-process broker for tests and the demo command.
//!
//! Routes through a [`Topology`] (or straight to a queue on the default
//! exchange), keeps one unbounded channel per queue, and tracks handed-out
//! deliveries until they are acknowledged. Fault hooks
//! simulate a dropped connection, a broker nack, and redelivery after a
//! consumer crash.

use super::{Broker, ConfirmListener, NO_ROUTE, Publish, Signal, confirm_signal, emit};
use crate::error::{Error, Result};
use crate::model::{Delivery, Envelope};
use crate::topology::Topology;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tracing::{debug, warn};

struct Queue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Delivery>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: AsyncMutex::new(rx),
        }
    }
}

pub struct InMemoryBroker {
    topology: Topology,
    listener: Arc<dyn ConfirmListener>,
    queues: DashMap<String, Arc<Queue>>,
    unacked: DashMap<u64, Delivery>,
    next_tag: AtomicU64,
    closed: AtomicBool,
    closed_notify: Notify,
    reject_next: Mutex<Option<String>>,
}

impl InMemoryBroker {
    /// Declare every queue in `topology`; confirms go to `listener`.
    pub fn new(topology: Topology, listener: Arc<dyn ConfirmListener>) -> Self {
        let queues = DashMap::new();
        for name in topology.queues() {
            queues.insert(name.to_string(), Arc::new(Queue::new()));
        }
        Self {
            topology,
            listener,
            queues,
            unacked: DashMap::new(),
            next_tag: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            reject_next: Mutex::new(None),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Drop the connection: publishes fail and waiting consumers return `None`.
    /// Queued messages survive.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Nack the next publish with `reason` instead of routing it.
    pub fn reject_next(&self, reason: impl Into<String>) {
        *self
            .reject_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    /// Put every unacknowledged delivery back on its queue, flagged as
    /// redelivered. Returns how many were requeued.
    pub fn redeliver_unacked(&self) -> usize {
        let tags: Vec<u64> = self.unacked.iter().map(|e| *e.key()).collect();
        let mut requeued = 0;
        for tag in tags {
            if let Some((_, delivery)) = self.unacked.remove(&tag) {
                let queue = delivery.queue.clone();
                self.enqueue(&queue, delivery.envelope, true);
                requeued += 1;
            }
        }
        debug!(requeued, "redelivered unacked messages");
        requeued
    }

    /// Deliveries handed out but not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }

    /// `false` when no such queue exists.
    fn enqueue(&self, queue: &str, envelope: Envelope, redelivered: bool) -> bool {
        let Some(q) = self.queues.get(queue).map(|q| Arc::clone(q.value())) else {
            return false;
        };
        let delivery = Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            queue: queue.to_string(),
            redelivered,
            envelope,
        };
        if q.tx.send(delivery).is_err() {
            warn!(queue, "queue receiver gone, message dropped");
        }
        true
    }
}

impl Broker for InMemoryBroker {
    async fn publish(&self, publish: Publish) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportUnavailable("connection closed".to_string()));
        }

        let rejection = self
            .reject_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut signals = Vec::with_capacity(2);
        if rejection.is_none() {
            let target = if publish.exchange.is_empty() {
                Some(publish.routing_key.as_str())
            } else {
                self.topology.route(&publish.exchange, &publish.routing_key)
            };
            let routed = target.is_some_and(|queue| self.enqueue(queue, publish.envelope.clone(), false));
            if !routed {
                if publish.mandatory {
                    signals.push(Signal::Returned(publish.envelope.clone(), NO_ROUTE.to_string()));
                } else {
                    debug!(
                        exchange = %publish.exchange,
                        routing_key = %publish.routing_key,
                        "unroutable non-mandatory publish dropped"
                    );
                }
            }
        }
        signals.push(confirm_signal(publish.envelope, rejection));
        emit(&self.listener, signals);
        Ok(())
    }

    async fn next_delivery(&self, queue: &str) -> Result<Option<Delivery>> {
        let q = self
            .queues
            .get(queue)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| Error::Other(format!("no such queue: {queue}")))?;

        // Register for the close wakeup before checking the flag.
        let closed = self.closed_notify.notified();
        if self.is_closed() {
            return Ok(None);
        }

        let mut rx = q.rx.lock().await;
        let delivery = tokio::select! {
            _ = closed => return Ok(None),
            d = rx.recv() => d,
        };
        if let Some(ref d) = delivery {
            self.unacked.insert(d.tag, d.clone());
        }
        Ok(delivery)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.unacked
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| Error::Other(format!("unknown delivery tag {}", delivery.tag)))
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportUnavailable("connection closed".to_string()));
        }
        self.queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Queue::new()));
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        if self.queues.remove(queue).is_some() {
            self.unacked.retain(|_, d| d.queue != queue);
        }
        Ok(())
    }
}
