//! Scoped transactions.
//!
//! A [`Transaction`] is an RAII guard over a mutably borrowed
//! [`Connection`]: the outermost scope wraps a real `BEGIN`/`COMMIT`, inner
//! scopes wrap savepoints. The guard derefs to the connection, so queries
//! run through it directly and a nested `transaction()` call borrows its
//! parent - nesting is stack-like by construction.
//!
//! Exactly one resolving action happens per entered scope. `commit` and
//! `rollback` resolve explicitly; a guard dropped unresolved (early return,
//! error unwind, cancelled future) queues its rollback statements on the
//! connection, where they run before the connection's next operation or
//! when the pool reclaims it.

use crate::connection::Connection;
use crate::driver::Driver;
use crate::error::{Error, Result, TransactionError};
use std::ops::{Deref, DerefMut};
use tracing::debug;

pub struct Transaction<'c, D: Driver> {
    conn: &'c mut Connection<D>,
    /// Depth of this scope, 1-based; 1 is the outermost.
    depth: usize,
    /// `None` for the outermost scope, the savepoint name otherwise.
    savepoint: Option<String>,
    done: bool,
}

impl<'c, D: Driver> Transaction<'c, D> {
    pub(crate) fn new(conn: &'c mut Connection<D>, savepoint: Option<String>) -> Self {
        let depth = conn.tx_depth;
        Self {
            conn,
            depth,
            savepoint,
            done: false,
        }
    }

    /// Nesting depth of this scope (1 = outermost).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Commit this scope: `COMMIT` for the outermost, `RELEASE SAVEPOINT`
    /// for a nested one.
    pub async fn commit(mut self) -> Result<()> {
        self.conn.flush_deferred().await?;
        let stmt = match &self.savepoint {
            None => "COMMIT".to_string(),
            Some(name) => format!("RELEASE SAVEPOINT {name}"),
        };
        let result = self.conn.run_control(&stmt).await;
        self.done = true;
        self.conn.tx_depth -= 1;
        match result {
            Ok(_) => {
                debug!(depth = self.depth, "transaction scope committed");
                Ok(())
            }
            Err(fault) => Err(Error::from(TransactionError::CommitFailed {
                depth: self.depth,
                message: fault.message,
            })),
        }
    }

    /// Roll back this scope. The outermost issues `ROLLBACK`; a nested
    /// scope rolls back to its savepoint and releases it, leaving the outer
    /// transaction open with its preceding work intact.
    pub async fn rollback(mut self) -> Result<()> {
        self.conn.flush_deferred().await?;
        let result = match self.savepoint.clone() {
            None => self.conn.run_control("ROLLBACK").await.map(|_| ()),
            Some(name) => {
                match self
                    .conn
                    .run_control(&format!("ROLLBACK TO SAVEPOINT {name}"))
                    .await
                {
                    Ok(_) => self
                        .conn
                        .run_control(&format!("RELEASE SAVEPOINT {name}"))
                        .await
                        .map(|_| ()),
                    Err(fault) => Err(fault),
                }
            }
        };
        self.done = true;
        self.conn.tx_depth -= 1;
        match result {
            Ok(()) => {
                debug!(depth = self.depth, "transaction scope rolled back");
                Ok(())
            }
            Err(fault) => Err(Error::from(TransactionError::RollbackFailed {
                depth: self.depth,
                message: fault.message,
            })),
        }
    }
}

impl<D: Driver> Drop for Transaction<'_, D> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Scope exited without an awaited resolution: queue the rollback.
        match &self.savepoint {
            None => {
                self.conn.deferred.push((self.depth, "ROLLBACK".to_string()));
            }
            Some(name) => {
                self.conn
                    .deferred
                    .push((self.depth, format!("ROLLBACK TO SAVEPOINT {name}")));
                self.conn
                    .deferred
                    .push((self.depth, format!("RELEASE SAVEPOINT {name}")));
            }
        }
        self.conn.tx_depth -= 1;
        debug!(
            depth = self.depth,
            "transaction scope dropped unresolved, rollback deferred"
        );
    }
}

impl<D: Driver> Deref for Transaction<'_, D> {
    type Target = Connection<D>;

    fn deref(&self) -> &Self::Target {
        self.conn
    }
}

impl<D: Driver> DerefMut for Transaction<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
    }
}
