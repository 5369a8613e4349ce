//! Broker binding over Postgres + pgmq.
//!
//! The topology's exchange and bindings are resolved here; each bound queue
//! is a pgmq queue, and the default exchange (`""`) addresses any pgmq queue
//! by name. Publishing checks out a connection before returning, so an
//! unreachable database fails the publish; the send itself runs off the
//! caller's task and reports its verdict to the confirm listener.
//!
//! Consumers poll `pgmq.read` with a visibility timeout, so a message whose
//! consumer dies before acking reappears later flagged as redelivered. Ack
//! archives the message.

use super::{Broker, ConfirmListener, NO_ROUTE, Publish, Signal, confirm_signal, emit};
use crate::db::Db;
use crate::db::pgmq::PgmqMessage;
use crate::error::{Error, Result};
use crate::model::{Delivery, Envelope};
use crate::topology::Topology;
use sqlx::PgConnection;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct PgmqConfig {
    /// Seconds a read message stays hidden before it is handed out again.
    pub visibility_timeout: i32,
    /// Sleep between reads of an empty queue.
    pub poll_interval: Duration,
}

impl Default for PgmqConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: 30,
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct PgmqBroker {
    db: Arc<Db>,
    topology: Topology,
    listener: Arc<dyn ConfirmListener>,
    config: PgmqConfig,
}

/// pgmq queue names become table names: only `[a-z0-9_]` survive.
pub fn pgmq_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl PgmqBroker {
    pub fn new(
        db: Arc<Db>,
        topology: Topology,
        listener: Arc<dyn ConfirmListener>,
        config: PgmqConfig,
    ) -> Self {
        Self {
            db,
            topology,
            listener,
            config,
        }
    }

    /// Create every queue the topology binds (idempotent).
    pub async fn declare(&self) -> Result<()> {
        for queue in self.topology.queues() {
            self.declare_queue(queue).await?;
        }
        Ok(())
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn to_delivery(queue: &str, msg: PgmqMessage) -> Result<Delivery> {
        let envelope: Envelope = serde_json::from_value(msg.message)?;
        Ok(Delivery {
            tag: msg.msg_id as u64,
            queue: queue.to_string(),
            redelivered: msg.read_ct > 1,
            envelope,
        })
    }
}

/// Send `payload` unless `check_exists` finds no such queue (`Ok(None)`).
async fn deliver(
    conn: &mut PgConnection,
    queue: &str,
    check_exists: bool,
    payload: &serde_json::Value,
) -> Result<Option<i64>> {
    if check_exists && !Db::queue_exists_on(conn, queue).await? {
        return Ok(None);
    }
    Db::send_on(conn, queue, payload).await.map(Some)
}

impl Broker for PgmqBroker {
    async fn publish(&self, publish: Publish) -> Result<()> {
        if self.db.is_closed() {
            return Err(Error::TransportUnavailable("postgres pool closed".to_string()));
        }

        let direct = publish.exchange.is_empty();
        let target = if direct {
            Some(publish.routing_key.as_str())
        } else {
            self.topology.route(&publish.exchange, &publish.routing_key)
        };
        let Some(queue) = target.map(pgmq_name) else {
            let mut signals = Vec::with_capacity(2);
            if publish.mandatory {
                signals.push(Signal::Returned(publish.envelope.clone(), NO_ROUTE.to_string()));
            }
            signals.push(confirm_signal(publish.envelope, None));
            emit(&self.listener, signals);
            return Ok(());
        };

        let payload = serde_json::to_value(&publish.envelope)?;
        let mut conn = self.db.acquire().await?;
        let listener = Arc::clone(&self.listener);
        tokio::spawn(async move {
            let mut signals = Vec::with_capacity(2);
            let rejection = match deliver(&mut conn, &queue, direct, &payload).await {
                Ok(Some(msg_id)) => {
                    debug!(queue = %queue, msg_id, "pgmq send");
                    None
                }
                Ok(None) => {
                    if publish.mandatory {
                        signals.push(Signal::Returned(
                            publish.envelope.clone(),
                            NO_ROUTE.to_string(),
                        ));
                    }
                    None
                }
                Err(e) => Some(e.to_string()),
            };
            signals.push(confirm_signal(publish.envelope, rejection));
            emit(&listener, signals);
        });
        Ok(())
    }

    async fn next_delivery(&self, queue: &str) -> Result<Option<Delivery>> {
        let name = pgmq_name(queue);
        loop {
            if self.db.is_closed() {
                return Ok(None);
            }
            let Some(msg) = self
                .db
                .read_from_queue(&name, self.config.visibility_timeout)
                .await?
            else {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            };

            let msg_id = msg.msg_id;
            match Self::to_delivery(queue, msg) {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(e) => {
                    // Not an envelope: park it in the archive instead of
                    // letting it bounce back every visibility timeout.
                    error!(queue, msg_id, "undecodable message archived: {e}");
                    self.db.archive_message(&name, msg_id).await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.db
            .archive_message(&pgmq_name(&delivery.queue), delivery.tag as i64)
            .await
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.db.create_queue(&pgmq_name(queue)).await
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.db.drop_queue(&pgmq_name(queue)).await
    }
}
