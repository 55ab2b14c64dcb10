//! In-memory mock driver shared by the integration suites.
//!
//! Records every statement (and its ordered arguments) in a journal,
//! serves scripted result sets, and can be told to fault on specific
//! statements. Connections share the driver's state, so the journal shows
//! the exact statement order the pool and transaction machinery produced.

#![allow(dead_code)]

use async_trait::async_trait;
use fastpg::{Driver, DriverConnection, DriverFault, Record, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct MockState {
    journal: Mutex<Vec<(String, Vec<Value>)>>,
    responses: Mutex<HashMap<String, Vec<Record>>>,
    fail_on: Mutex<HashSet<String>>,
    connect_count: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

#[derive(Clone, Default)]
pub struct MockDriver {
    pub state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement issued so far, in order, with its arguments.
    pub fn journal(&self) -> Vec<(String, Vec<Value>)> {
        self.state.journal.lock().unwrap().clone()
    }

    /// Statement texts only, in order.
    pub fn statements(&self) -> Vec<String> {
        self.journal().into_iter().map(|(sql, _)| sql).collect()
    }

    pub fn clear_journal(&self) {
        self.state.journal.lock().unwrap().clear();
    }

    /// Script the rows returned for an exact (rewritten) statement.
    pub fn respond(&self, sql: &str, rows: Vec<Record>) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(sql.to_string(), rows);
    }

    /// Make an exact statement fault when executed.
    pub fn fail_on(&self, sql: &str) {
        self.state.fail_on.lock().unwrap().insert(sql.to_string());
    }

    /// Add artificial latency to every statement.
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock().unwrap() = Some(latency);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connect_count.load(Ordering::SeqCst)
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
}

impl MockConnection {
    async fn run(&self, sql: &str, args: &[Value]) -> Result<(), DriverFault> {
        let latency = *self.state.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.state
            .journal
            .lock()
            .unwrap()
            .push((sql.to_string(), args.to_vec()));
        if self.state.fail_on.lock().unwrap().contains(sql) {
            return Err(DriverFault::new(format!("forced failure for: {sql}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for MockDriver {
    type Connection = MockConnection;

    async fn connect(&self, _dsn: &str) -> Result<MockConnection, DriverFault> {
        self.state.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            state: Arc::clone(&self.state),
        })
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DriverFault> {
        self.run(sql, args).await?;
        Ok(1)
    }

    async fn execute_batch(
        &mut self,
        sql: &str,
        batches: &[Vec<Value>],
    ) -> Result<u64, DriverFault> {
        for args in batches {
            self.run(sql, args).await?;
        }
        Ok(batches.len() as u64)
    }

    async fn fetch(&mut self, sql: &str, args: &[Value]) -> Result<Vec<Record>, DriverFault> {
        self.run(sql, args).await?;
        Ok(self
            .state
            .responses
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .unwrap_or_default())
    }

    async fn copy_in(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, DriverFault> {
        let sql = format!("COPY {table} ({})", columns.join(", "));
        let flattened: Vec<Value> = rows.iter().flatten().cloned().collect();
        self.run(&sql, &flattened).await?;
        Ok(rows.len() as u64)
    }

    async fn close(self) -> Result<(), DriverFault> {
        self.state
            .journal
            .lock()
            .unwrap()
            .push(("(close)".to_string(), Vec::new()));
        Ok(())
    }
}

/// Build a record from (column, value) pairs.
pub fn record(pairs: &[(&str, Value)]) -> Record {
    Record::new(
        pairs.iter().map(|(c, _)| c.to_string()).collect(),
        pairs.iter().map(|(_, v)| v.clone()).collect(),
    )
}

/// Wait until `predicate` holds, for tests that observe spawned cleanup.
pub async fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}
