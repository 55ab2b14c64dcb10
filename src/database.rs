//! The database facade.
//!
//! `Database` is an explicit instance owned by the caller - there is no
//! process-wide singleton. It composes the pool and the parameter binder
//! behind the one-shot operation surface; each operation acquires a
//! connection, runs, and releases on every exit path. `connection()` hands
//! the caller a scoped handle for manual multi-statement or transactional
//! work.

use crate::bind::Arguments;
use crate::config::PoolOptions;
use crate::driver::Driver;
use crate::driver::postgres::Postgres;
use crate::error::{PoolError, Result};
use crate::pool::{Pool, PoolStatus, PooledConn};
use crate::value::{Record, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct Database<D: Driver = Postgres> {
    driver: D,
    dsn: String,
    options: PoolOptions,
    force_rollback: bool,
    pool: RwLock<Option<Pool<D>>>,
}

impl Database<Postgres> {
    /// Build a PostgreSQL database handle from a DSN. Pool options may ride
    /// in the DSN query string (`?max_size=10&min_size=2&acquire_timeout=30`)
    /// and are stripped before the DSN reaches the driver.
    pub fn new(dsn: &str) -> Result<Self> {
        let (dsn, options) = PoolOptions::from_dsn(dsn)?;
        Ok(Self::with_driver(Postgres, dsn, options))
    }
}

impl<D: Driver> Database<D> {
    /// Build a database handle over an explicit driver.
    pub fn with_driver(driver: D, dsn: impl Into<String>, options: PoolOptions) -> Self {
        Self {
            driver,
            dsn: dsn.into(),
            options,
            force_rollback: false,
            pool: RwLock::new(None),
        }
    }

    /// Test mode: cap the pool at one connection, open a transaction on
    /// every acquisition and roll it back on release, so no work persists
    /// across scopes and nothing ever commits.
    pub fn force_rollback(mut self, enabled: bool) -> Self {
        self.force_rollback = enabled;
        self
    }

    /// Open the connection pool. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            debug!("connect() called on an already-connected database");
            return Ok(());
        }
        let mut options = self.options.clone();
        if self.force_rollback {
            options.max_size = Some(1);
        }
        let pool = Pool::open(
            self.driver.clone(),
            &self.dsn,
            &options,
            self.force_rollback,
        )
        .await?;
        *guard = Some(pool);
        info!(force_rollback = self.force_rollback, "database connected");
        Ok(())
    }

    /// Close the pool and reject further operations. A no-op when already
    /// disconnected.
    pub async fn disconnect(&self) {
        let pool = self.pool.write().await.take();
        match pool {
            Some(pool) => {
                pool.close().await;
                info!("database disconnected");
            }
            None => debug!("disconnect() called on an already-disconnected database"),
        }
    }

    async fn pool(&self) -> Result<Pool<D>> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| PoolError::Closed.into())
    }

    /// Pool counters, for observation and tests. Fails when disconnected.
    pub async fn status(&self) -> Result<PoolStatus> {
        Ok(self.pool().await?.status())
    }

    /// Acquire a scoped connection for manual multi-statement or
    /// transactional use. The connection returns to the pool when the
    /// handle drops, on every exit path.
    pub async fn connection(&self) -> Result<PooledConn<D>> {
        self.pool().await?.acquire(None).await
    }

    /// Run a statement once and return its affected row count.
    pub async fn execute(&self, query: &str, args: &Arguments) -> Result<u64> {
        let mut conn = self.connection().await?;
        conn.execute(query, args).await
    }

    /// Run one statement once per argument set over a single acquired
    /// connection, binding the query once and reusing the prepared
    /// statement rather than paying an acquire-release cycle per set.
    pub async fn execute_many(&self, query: &str, value_sets: &[Arguments]) -> Result<u64> {
        let mut conn = self.connection().await?;
        conn.execute_many(query, value_sets).await
    }

    /// Run a query and collect every row, in the order the driver returns
    /// them.
    pub async fn fetch_many(&self, query: &str, args: &Arguments) -> Result<Vec<Record>> {
        let mut conn = self.connection().await?;
        conn.fetch_many(query, args).await
    }

    /// Run a query and return its first row, or `None` for an empty result.
    /// When several rows match, the first is kept; that is documented
    /// policy, not an error.
    pub async fn fetch_one(&self, query: &str, args: &Arguments) -> Result<Option<Record>> {
        let mut conn = self.connection().await?;
        conn.fetch_one(query, args).await
    }

    /// Run a query and return the first column of its first row, or `None`
    /// for an empty result.
    pub async fn fetch_val(&self, query: &str, args: &Arguments) -> Result<Option<Value>> {
        let mut conn = self.connection().await?;
        conn.fetch_val(query, args).await
    }

    /// Bulk-load fixed-arity records into `table` through the driver's copy
    /// fast path. Every record's arity is checked against `columns` before
    /// any data is sent; no per-row SQL text is constructed.
    pub async fn copy_records_to_table(
        &self,
        table: &str,
        records: &[Vec<Value>],
        columns: &[String],
    ) -> Result<u64> {
        let mut conn = self.connection().await?;
        conn.copy_records_to_table(table, records, columns).await
    }
}

// The DSN stays out of Debug output: it can carry credentials.
impl<D: Driver> std::fmt::Debug for Database<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("force_rollback", &self.force_rollback)
            .finish_non_exhaustive()
    }
}
