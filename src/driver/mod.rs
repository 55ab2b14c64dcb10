//! The external driver seam.
//!
//! Everything below the facade speaks to the database through these traits:
//! a [`Driver`] establishes connections, a [`DriverConnection`] accepts
//! fully-positional SQL plus an ordered argument list and returns rows or
//! faults. The wire protocol, SQL parsing, and query planning all live on
//! the driver side of this seam. The production implementation is
//! [`postgres::Postgres`] over sqlx; tests substitute an in-memory mock.

pub mod postgres;

use crate::value::{Record, Value};
use async_trait::async_trait;
use thiserror::Error;

/// A failure reported by the driver. Wrapped into [`crate::Error::Driver`]
/// (or a transaction error) by the layer that knows the original query.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct DriverFault {
    pub message: String,
    /// Server error code when the driver exposes one.
    pub sql_state: Option<String>,
}

impl DriverFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
        }
    }
}

/// Factory for driver connections.
#[async_trait]
pub trait Driver: Clone + Send + Sync + 'static {
    type Connection: DriverConnection;

    /// Establish one connection to the server named by the DSN.
    async fn connect(&self, dsn: &str) -> Result<Self::Connection, DriverFault>;
}

/// One established connection. All SQL reaching a driver connection is
/// already positional (`$k`); arguments arrive in marker order.
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Run a statement, returning the affected row count.
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DriverFault>;

    /// Run one statement once per argument set, reusing the prepared
    /// statement. Returns the total affected row count.
    async fn execute_batch(&mut self, sql: &str, batches: &[Vec<Value>])
    -> Result<u64, DriverFault>;

    /// Run a statement and collect its rows in server order.
    async fn fetch(&mut self, sql: &str, args: &[Value]) -> Result<Vec<Record>, DriverFault>;

    /// Bulk-load rows into a table through the driver's copy fast path,
    /// bypassing per-row SQL text. Returns the number of rows loaded.
    async fn copy_in(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, DriverFault>;

    /// Close the connection gracefully.
    async fn close(self) -> Result<(), DriverFault>;
}
