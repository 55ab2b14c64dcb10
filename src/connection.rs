//! One pooled connection.
//!
//! `Connection` owns a single driver connection and runs the full binding
//! pipeline for every operation: rewrite the query, resolve arguments,
//! dispatch, and annotate driver faults with the original query text and
//! placeholder names. It also keeps the transaction bookkeeping - current
//! nesting depth, the savepoint sequence, and rollback statements deferred
//! by transaction scopes that were dropped without an awaited resolution.

use crate::bind::{self, Arguments};
use crate::driver::{Driver, DriverConnection, DriverFault};
use crate::error::{CopyError, Error, Result, TransactionError};
use crate::transaction::Transaction;
use crate::value::{Record, Value};
use tracing::debug;

pub struct Connection<D: Driver> {
    raw: D::Connection,
    pub(crate) tx_depth: usize,
    pub(crate) savepoint_seq: u64,
    /// Rollback statements queued by dropped transaction scopes, oldest
    /// first, each tagged with the depth of the scope that queued it.
    pub(crate) deferred: Vec<(usize, String)>,
}

impl<D: Driver> Connection<D> {
    pub(crate) fn new(raw: D::Connection) -> Self {
        Self {
            raw,
            tx_depth: 0,
            savepoint_seq: 0,
            deferred: Vec::new(),
        }
    }

    /// Current transaction nesting depth (0 = no open transaction).
    pub fn transaction_depth(&self) -> usize {
        self.tx_depth
    }

    /// Run a statement and return its affected row count.
    pub async fn execute(&mut self, query: &str, args: &Arguments) -> Result<u64> {
        self.flush_deferred().await?;
        let bound = bind::bind(query)?;
        let ordered = bound.resolve(args)?;
        debug!(sql = %bound.sql, params = bound.names.len(), "executing statement");
        self.raw
            .execute(&bound.sql, &ordered)
            .await
            .map_err(|f| Error::driver(f, query, &bound.names))
    }

    /// Run one statement once per argument set on this connection, binding
    /// the query once and reusing the prepared statement. All sets are
    /// resolved up front, so a missing parameter fails before anything is
    /// sent.
    pub async fn execute_many(&mut self, query: &str, value_sets: &[Arguments]) -> Result<u64> {
        self.flush_deferred().await?;
        let bound = bind::bind(query)?;
        let mut batches = Vec::with_capacity(value_sets.len());
        for set in value_sets {
            batches.push(bound.resolve(set)?);
        }
        if batches.is_empty() {
            return Ok(0);
        }
        debug!(sql = %bound.sql, sets = batches.len(), "executing batch");
        self.raw
            .execute_batch(&bound.sql, &batches)
            .await
            .map_err(|f| Error::driver(f, query, &bound.names))
    }

    /// Run a query and collect every row, in the order the driver returns
    /// them.
    pub async fn fetch_many(&mut self, query: &str, args: &Arguments) -> Result<Vec<Record>> {
        self.flush_deferred().await?;
        let bound = bind::bind(query)?;
        let ordered = bound.resolve(args)?;
        debug!(sql = %bound.sql, params = bound.names.len(), "fetching rows");
        self.raw
            .fetch(&bound.sql, &ordered)
            .await
            .map_err(|f| Error::driver(f, query, &bound.names))
    }

    /// Run a query and return its first row, or `None` for an empty result.
    /// When several rows match, the first is kept and the rest discarded;
    /// that is documented policy, not an error.
    pub async fn fetch_one(&mut self, query: &str, args: &Arguments) -> Result<Option<Record>> {
        let rows = self.fetch_many(query, args).await?;
        Ok(rows.into_iter().next())
    }

    /// Run a query and return the first column of its first row, or `None`
    /// for an empty result.
    pub async fn fetch_val(&mut self, query: &str, args: &Arguments) -> Result<Option<Value>> {
        let row = self.fetch_one(query, args).await?;
        Ok(row.and_then(|r| r.into_values().into_iter().next()))
    }

    /// Bulk-load fixed-arity records into `table`. Every record's arity is
    /// checked against the column list before any data is sent.
    pub async fn copy_records_to_table(
        &mut self,
        table: &str,
        records: &[Vec<Value>],
        columns: &[String],
    ) -> Result<u64> {
        for (index, record) in records.iter().enumerate() {
            if record.len() != columns.len() {
                return Err(CopyError::ArityMismatch {
                    index,
                    expected: columns.len(),
                    got: record.len(),
                }
                .into());
            }
        }
        self.flush_deferred().await?;
        self.raw
            .copy_in(table, columns, records)
            .await
            .map_err(|f| Error::driver(f, format!("COPY {table}"), columns))
    }

    /// Open a transaction scope. At depth 0 this issues a real `BEGIN`; at
    /// depth >= 1 it creates a uniquely named savepoint. The returned guard
    /// commits or rolls back exactly once, on every exit path; scopes nest
    /// strictly because the guard mutably borrows this connection.
    pub async fn transaction(&mut self) -> Result<Transaction<'_, D>> {
        self.flush_deferred().await?;
        if self.tx_depth == 0 {
            self.run_control("BEGIN")
                .await
                .map_err(|f| Error::driver(f, "BEGIN", &[]))?;
            self.tx_depth = 1;
            debug!("transaction started");
            Ok(Transaction::new(self, None))
        } else {
            self.savepoint_seq += 1;
            let name = format!("fastpg_sp_{}", self.savepoint_seq);
            self.run_control(&format!("SAVEPOINT {name}"))
                .await
                .map_err(|f| Error::driver(f, format!("SAVEPOINT {name}"), &[]))?;
            self.tx_depth += 1;
            debug!(savepoint = %name, depth = self.tx_depth, "savepoint created");
            Ok(Transaction::new(self, Some(name)))
        }
    }

    /// Run a transaction-control statement, bypassing the binder.
    pub(crate) async fn run_control(&mut self, stmt: &str) -> Result<u64, DriverFault> {
        self.raw.execute(stmt, &[]).await
    }

    /// Execute rollback statements queued by dropped transaction scopes.
    /// Runs before every operation and before the connection goes back to
    /// the idle set.
    pub(crate) async fn flush_deferred(&mut self) -> Result<()> {
        while let Some((depth, stmt)) = self.deferred.first().cloned() {
            debug!(stmt = %stmt, depth, "running deferred rollback");
            match self.raw.execute(&stmt, &[]).await {
                Ok(_) => {
                    self.deferred.remove(0);
                }
                Err(fault) => {
                    return Err(TransactionError::RollbackFailed {
                        depth,
                        message: fault.message,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Whether release back to the pool needs async cleanup first.
    pub(crate) fn needs_cleanup(&self) -> bool {
        !self.deferred.is_empty() || self.tx_depth > 0
    }

    /// Restore the connection to a clean state: flush deferred rollbacks,
    /// then roll back any transaction still open (a scope abandoned by
    /// cancellation, or a force-rollback acquisition).
    pub(crate) async fn cleanup(&mut self) -> Result<()> {
        self.flush_deferred().await?;
        if self.tx_depth > 0 {
            let depth = self.tx_depth;
            self.run_control("ROLLBACK")
                .await
                .map_err(|f| TransactionError::RollbackFailed {
                    depth,
                    message: f.message,
                })?;
            self.tx_depth = 0;
            debug!(depth, "rolled back abandoned transaction");
        }
        Ok(())
    }

    /// Open the outermost transaction without a guard. Used by the pool's
    /// force-rollback acquisition path; release cleanup pairs it with the
    /// rollback.
    pub(crate) async fn force_begin(&mut self) -> Result<()> {
        self.run_control("BEGIN")
            .await
            .map_err(|f| Error::driver(f, "BEGIN", &[]))?;
        self.tx_depth = 1;
        Ok(())
    }

    pub(crate) fn into_raw(self) -> D::Connection {
        self.raw
    }
}
