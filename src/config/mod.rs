//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in `secrecy::SecretString` to keep it out of logs.

use crate::broker::pgmq::PgmqConfig;
use crate::dedup::{DEFAULT_SWEEP_EVERY, DEFAULT_TTL};
use crate::error::{Error, Result};
use crate::topology::Topology;
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub dedup_ttl: Duration,
    pub dedup_sweep_every: u64,
    pub notification_from: String,
    pub notification_to: String,
    /// TOML file overriding the default topology.
    pub topology_path: Option<PathBuf>,
    pub pgmq: PgmqConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let visibility_timeout = parsed_var("PGMQ_VISIBILITY_TIMEOUT", 30)?;
        let poll_interval_ms = parsed_var("PGMQ_POLL_INTERVAL_MS", 500u64)?;
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dedup_ttl: Duration::from_secs(parsed_var(
                "DEDUP_TTL_SECONDS",
                DEFAULT_TTL.as_secs(),
            )?),
            dedup_sweep_every: parsed_var("DEDUP_SWEEP_EVERY", DEFAULT_SWEEP_EVERY)?,
            notification_from: required_var("NOTIFICATION_FROM")?,
            notification_to: required_var("NOTIFICATION_TO")?,
            topology_path: std::env::var("RELAY_TOPOLOGY").ok().map(PathBuf::from),
            pgmq: PgmqConfig {
                visibility_timeout,
                poll_interval: Duration::from_millis(poll_interval_ms),
            },
        })
    }

    /// The configured topology, or the default one.
    pub fn topology(&self) -> Result<Topology> {
        match self.topology_path {
            Some(ref path) => Topology::load(path),
            None => Ok(Topology::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
