//! Postgres connection pool, migrations, and health check.
//!
//! The pool backs the pgmq broker binding.

pub mod pgmq;

use crate::error::{Error, Result};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use std::time::Duration;

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| Error::TransportUnavailable(format!("cannot connect to postgres: {e}")))?;
        Ok(Self { pool })
    }

    /// Build the pool without connecting. The first query (or
    /// [`acquire`](Self::acquire)) opens a connection, waiting at most
    /// `acquire_timeout` for one.
    pub fn connect_lazy(url: &str, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)
            .map_err(|e| Error::Config(format!("bad database url: {e}")))?;
        Ok(Self { pool })
    }

    /// Check out a pooled connection. Failing here means Postgres cannot be
    /// reached (or the pool is closed), so nothing has been sent.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| Error::TransportUnavailable(format!("cannot reach postgres: {e}")))
    }

    /// Install the pgmq extension if it is missing.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close every connection; later queries fail with `PoolClosed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
