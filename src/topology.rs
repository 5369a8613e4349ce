//! Routing surface shared by dispatchers and workers.
//!
//! One direct exchange with two bindings: the work routing key to the work
//! queue, the reply routing key to the reply queue. Pure data; brokers read
//! it to declare queues and resolve routes.

use crate::error::{Error, Result};
use crate::model::ReplyAddress;
use serde::Deserialize;
use std::path::Path;
use uuid::Uuid;

pub const DEFAULT_EXCHANGE: &str = "app.direct";
pub const DEFAULT_WORK_QUEUE: &str = "work.queue";
pub const DEFAULT_REPLY_QUEUE: &str = "reply.queue";
pub const DEFAULT_WORK_ROUTING_KEY: &str = "work";
pub const DEFAULT_REPLY_ROUTING_KEY: &str = "reply";

/// Named exchange, queues, and routing keys.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub exchange: String,
    pub work_queue: String,
    pub reply_queue: String,
    pub work_routing_key: String,
    pub reply_routing_key: String,
}

/// One `(exchange, routing key) -> queue` binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub queue: &'a str,
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    topology: Topology,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            work_queue: DEFAULT_WORK_QUEUE.to_string(),
            reply_queue: DEFAULT_REPLY_QUEUE.to_string(),
            work_routing_key: DEFAULT_WORK_ROUTING_KEY.to_string(),
            reply_routing_key: DEFAULT_REPLY_ROUTING_KEY.to_string(),
        }
    }
}

impl Topology {
    /// Load a `[topology]` table from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read topology {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad topology {}: {e}", path.display())))
    }

    fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        let file: TopologyFile = toml::from_str(content)?;
        Ok(file.topology)
    }

    pub fn bindings(&self) -> [Binding<'_>; 2] {
        [
            Binding {
                exchange: &self.exchange,
                routing_key: &self.work_routing_key,
                queue: &self.work_queue,
            },
            Binding {
                exchange: &self.exchange,
                routing_key: &self.reply_routing_key,
                queue: &self.reply_queue,
            },
        ]
    }

    /// Queue bound to `exchange` under `routing_key`, if any.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Option<&str> {
        self.bindings()
            .into_iter()
            .find(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue)
    }

    /// Address dispatchers attach so workers know where to reply.
    pub fn reply_address(&self) -> ReplyAddress {
        ReplyAddress::new(&self.exchange, &self.reply_routing_key)
    }

    /// Fresh name for a requester's own reply queue, derived from the shared one.
    ///
    /// Replies addressed to it travel through the default exchange, so only the
    /// requester that declared it ever consumes them.
    pub fn private_reply_queue(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}.{}", self.reply_queue, &suffix[..8])
    }

    pub fn queues(&self) -> [&str; 2] {
        [&self.work_queue, &self.reply_queue]
    }
}
