//! The connection pool.
//!
//! A bounded set of driver connections with FIFO-fair acquisition. Waiting
//! acquirers park on oneshot channels in arrival order; a released
//! connection goes to the oldest live waiter, or back to the idle set. The
//! granted connection travels through the channel as an RAII handle, so a
//! waiter that gave up (timeout, cancellation) can never strand it: dropping
//! the un-received handle releases it again.
//!
//! Bookkeeping lives behind a sync mutex that is never held across an
//! await, which lets `Drop` release synchronously. A connection that still
//! has transaction state when its handle drops is cleaned up on a spawned
//! task before it becomes reusable.

use crate::config::PoolOptions;
use crate::connection::Connection;
use crate::driver::{Driver, DriverConnection};
use crate::error::{Error, PoolError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Observable pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Established connections: idle + acquired.
    pub total: u32,
    /// Connections sitting in the idle set.
    pub idle: u32,
    /// Callers parked waiting for a connection.
    pub waiting: u32,
}

struct PoolState<D: Driver> {
    idle: Vec<Connection<D>>,
    total: u32,
    waiters: VecDeque<oneshot::Sender<PooledConn<D>>>,
    closed: bool,
}

struct PoolInner<D: Driver> {
    driver: D,
    dsn: String,
    max_size: u32,
    acquire_timeout: Duration,
    /// force_rollback mode: begin on acquire, roll back on release.
    rollback_on_release: bool,
    state: Mutex<PoolState<D>>,
}

#[derive(Clone)]
pub struct Pool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Pool<D> {
    /// Open a pool, eagerly establishing `min_size` connections.
    pub async fn open(
        driver: D,
        dsn: impl Into<String>,
        options: &PoolOptions,
        rollback_on_release: bool,
    ) -> Result<Self> {
        let max_size = options.max_size_or_default();
        let min_size = options.min_size_or_default();
        let pool = Self {
            inner: Arc::new(PoolInner {
                driver,
                dsn: dsn.into(),
                max_size,
                acquire_timeout: options.acquire_timeout_or_default(),
                rollback_on_release,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    total: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        };

        for _ in 0..min_size {
            let raw = pool
                .inner
                .driver
                .connect(&pool.inner.dsn)
                .await
                .map_err(|f| Error::driver(f, "(connect)", &[]))?;
            let mut state = pool.inner.state.lock();
            state.idle.push(Connection::new(raw));
            state.total += 1;
        }

        info!(min_size, max_size, "connection pool opened");
        Ok(pool)
    }

    /// Current pool counters.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            total: state.total,
            idle: state.idle.len() as u32,
            waiting: state.waiters.len() as u32,
        }
    }

    /// Acquire a connection, waiting up to `timeout` (the pool's configured
    /// acquire timeout when `None`). Fails with [`PoolError::Closed`] on a
    /// closed pool and [`PoolError::AcquireTimeout`] when the wait elapses.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<PooledConn<D>> {
        let wait = timeout.unwrap_or(self.inner.acquire_timeout);

        enum Plan<D: Driver> {
            Ready(Connection<D>),
            Establish,
            Wait(oneshot::Receiver<PooledConn<D>>),
        }

        let plan = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::Closed.into());
            }
            if let Some(conn) = state.idle.pop() {
                Plan::Ready(conn)
            } else if state.total < self.inner.max_size {
                state.total += 1;
                Plan::Establish
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Plan::Wait(rx)
            }
        };

        let mut handle = match plan {
            Plan::Ready(conn) => PooledConn::new(Arc::clone(&self.inner), conn),
            Plan::Establish => match self.inner.driver.connect(&self.inner.dsn).await {
                Ok(raw) => PooledConn::new(Arc::clone(&self.inner), Connection::new(raw)),
                Err(fault) => {
                    // queued callers keep waiting for the next release
                    let mut state = self.inner.state.lock();
                    state.total -= 1;
                    return Err(Error::driver(fault, "(connect)", &[]));
                }
            },
            Plan::Wait(mut rx) => {
                debug!(timeout_secs = wait.as_secs(), "waiting for an idle connection");
                match tokio::time::timeout(wait, &mut rx).await {
                    Ok(Ok(handle)) => handle,
                    // all senders dropped: the pool was closed under us
                    Ok(Err(_)) => return Err(PoolError::Closed.into()),
                    Err(_) => {
                        // A connection may have been granted while the timer
                        // fired; reclaim it so it is not stranded.
                        rx.close();
                        if let Ok(granted) = rx.try_recv() {
                            drop(granted);
                        }
                        warn!(elapsed_secs = wait.as_secs(), "connection acquire timed out");
                        return Err(PoolError::AcquireTimeout {
                            elapsed_secs: wait.as_secs(),
                        }
                        .into());
                    }
                }
            }
        };

        if self.inner.rollback_on_release && handle.transaction_depth() == 0 {
            handle.force_begin().await?;
        }
        Ok(handle)
    }

    /// Close the pool: wake every waiter with [`PoolError::Closed`], close
    /// idle connections, and reject further acquires. Connections currently
    /// held are closed when their handles drop. Idempotent.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.total -= state.idle.len() as u32;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        drop(waiters);

        for conn in idle {
            if let Err(fault) = conn.into_raw().close().await {
                debug!(error = %fault, "error closing idle connection");
            }
        }
        info!("connection pool closed");
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl<D: Driver> PoolInner<D> {
    /// Return a connection to the pool: hand it to the oldest live waiter,
    /// or park it in the idle set. Dead waiters (cancelled or timed out)
    /// are skipped.
    fn route(inner: &Arc<Self>, mut conn: Connection<D>) {
        loop {
            let waiter = {
                let mut state = inner.state.lock();
                if state.closed {
                    state.total -= 1;
                    drop(state);
                    Self::discard(conn);
                    return;
                }
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.idle.push(conn);
                        return;
                    }
                }
            };
            let handle = PooledConn::new(Arc::clone(inner), conn);
            match waiter.send(handle) {
                Ok(()) => return,
                Err(dead) => match dead.into_inner() {
                    Some(reclaimed) => conn = reclaimed,
                    None => return,
                },
            }
        }
    }

    /// Release path for dropped handles.
    fn release(inner: &Arc<Self>, conn: Connection<D>) {
        if !conn.needs_cleanup() {
            Self::route(inner, conn);
            return;
        }

        // Deferred rollbacks or an open transaction: clean up on a task
        // before the connection becomes reusable.
        let inner = Arc::clone(inner);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    let mut conn = conn;
                    match conn.cleanup().await {
                        Ok(()) => Self::route(&inner, conn),
                        Err(e) => {
                            warn!(error = %e, "discarding connection after failed rollback");
                            let mut state = inner.state.lock();
                            state.total -= 1;
                        }
                    }
                });
            }
            Err(_) => {
                // No runtime (process teardown): drop the connection.
                let mut state = inner.state.lock();
                state.total -= 1;
            }
        }
    }

    /// Close a connection outside the pool's accounting.
    fn discard(conn: Connection<D>) {
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                let _ = conn.into_raw().close().await;
            });
        }
    }
}

/// An acquired connection. Derefs to [`Connection`]; dropping the handle
/// releases the connection back to the pool on every exit path.
pub struct PooledConn<D: Driver> {
    pool: Arc<PoolInner<D>>,
    conn: Option<Connection<D>>,
}

impl<D: Driver> PooledConn<D> {
    fn new(pool: Arc<PoolInner<D>>, conn: Connection<D>) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    /// Take the connection out without releasing it. Used when a dead
    /// waiter bounces a granted handle back to the release loop.
    fn into_inner(mut self) -> Option<Connection<D>> {
        self.conn.take()
    }
}

impl<D: Driver> std::fmt::Debug for PooledConn<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("held", &self.conn.is_some())
            .finish()
    }
}

impl<D: Driver> Deref for PooledConn<D> {
    type Target = Connection<D>;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already released")
    }
}

impl<D: Driver> DerefMut for PooledConn<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already released")
    }
}

impl<D: Driver> Drop for PooledConn<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            PoolInner::release(&self.pool, conn);
        }
    }
}
