//! Error types for fastpg.
//!
//! All errors derive `thiserror::Error`. The taxonomy mirrors where in the
//! pipeline a failure happens: binding and copy errors are raised before any
//! network call, pool errors when a connection cannot be served, transaction
//! errors when a resolving action at scope exit fails, and driver errors pass
//! the server's own failure through annotated with the original query.

use thiserror::Error;

/// Result type alias for fastpg operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Copy(#[from] CopyError),

    /// Passthrough of the driver's own error, annotated with the original
    /// (pre-translation) query text and the placeholder names for diagnosis.
    #[error("driver error: {message} (query: {query})")]
    Driver {
        message: String,
        /// Server error code when available, e.g. "42P01" for undefined table.
        sql_state: Option<String>,
        query: String,
        params: Vec<String>,
    },

    /// Malformed DSN or invalid pool options, detected at construction.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl Error {
    /// Wrap a driver fault with the query it was executing.
    pub(crate) fn driver(
        fault: crate::driver::DriverFault,
        query: impl Into<String>,
        params: &[String],
    ) -> Self {
        Self::Driver {
            message: fault.message,
            sql_state: fault.sql_state,
            query: query.into(),
            params: params.to_vec(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Get the server error code for driver errors, if available.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Driver { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }
}

/// Failures while translating named placeholders or resolving argument sets.
/// These are local: a query that fails to bind never reaches the driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("missing value for parameter :{name}")]
    MissingParameter { name: String },

    #[error("query takes {expected} positional values, {got} were supplied")]
    ArityMismatch { expected: usize, got: usize },

    #[error("unterminated {delimiter} quote opened at byte {opened_at}")]
    UnterminatedQuote { delimiter: String, opened_at: usize },
}

/// Failures acquiring a connection from the pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,

    #[error("timed out after {elapsed_secs}s waiting for a connection")]
    AcquireTimeout { elapsed_secs: u64 },
}

/// Failures of the resolving action at transaction scope exit, carrying the
/// nesting depth at which it occurred (1 = outermost).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("commit failed at depth {depth}: {message}")]
    CommitFailed { depth: usize, message: String },

    #[error("rollback failed at depth {depth}: {message}")]
    RollbackFailed { depth: usize, message: String },
}

/// Failures validating a bulk-copy request. Raised before any data is sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CopyError {
    #[error("record {index} has {got} values, expected {expected} to match the column list")]
    ArityMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },
}
