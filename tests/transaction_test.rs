//! Integration tests for scoped, nestable transactions.

mod common;

use common::{MockDriver, wait_for};
use fastpg::{Database, Error, PoolOptions, TransactionError, named_args};

fn database(driver: &MockDriver) -> Database<MockDriver> {
    Database::with_driver(
        driver.clone(),
        "mock://tx",
        PoolOptions {
            min_size: Some(1),
            max_size: Some(2),
            acquire_timeout_secs: Some(5),
        },
    )
}

#[tokio::test]
async fn test_outer_commit_sequence() {
    let driver = MockDriver::new();
    let db = database(&driver);
    db.connect().await.unwrap();

    let mut conn = db.connection().await.unwrap();
    let mut tx = conn.transaction().await.unwrap();
    assert_eq!(tx.depth(), 1);
    tx.execute("insert into t (a) values (:a)", &named_args! { "a" => 1i64 })
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(conn.transaction_depth(), 0);

    assert_eq!(
        driver.statements(),
        vec!["BEGIN", "insert into t (a) values ($1)", "COMMIT"]
    );
}

#[tokio::test]
async fn test_outer_rollback_sequence() {
    let driver = MockDriver::new();
    let db = database(&driver);
    db.connect().await.unwrap();

    let mut conn = db.connection().await.unwrap();
    let mut tx = conn.transaction().await.unwrap();
    tx.execute("delete from t", &Default::default())
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(
        driver.statements(),
        vec!["BEGIN", "delete from t", "ROLLBACK"]
    );
}

#[tokio::test]
async fn test_inner_rollback_preserves_outer_work() {
    let driver = MockDriver::new();
    let db = database(&driver);
    db.connect().await.unwrap();

    let mut conn = db.connection().await.unwrap();
    let mut tx = conn.transaction().await.unwrap();
    tx.execute("insert into t (a) values (:a)", &named_args! { "a" => 1i64 })
        .await
        .unwrap();

    let mut inner = tx.transaction().await.unwrap();
    assert_eq!(inner.depth(), 2);
    inner
        .execute("insert into t (a) values (:a)", &named_args! { "a" => 2i64 })
        .await
        .unwrap();
    inner.rollback().await.unwrap();

    tx.commit().await.unwrap();

    assert_eq!(
        driver.statements(),
        vec![
            "BEGIN",
            "insert into t (a) values ($1)",
            "SAVEPOINT fastpg_sp_1",
            "insert into t (a) values ($1)",
            "ROLLBACK TO SAVEPOINT fastpg_sp_1",
            "RELEASE SAVEPOINT fastpg_sp_1",
            "COMMIT",
        ]
    );
}

#[tokio::test]
async fn test_inner_commit_releases_savepoint() {
    let driver = MockDriver::new();
    let db = database(&driver);
    db.connect().await.unwrap();

    let mut conn = db.connection().await.unwrap();
    let mut tx = conn.transaction().await.unwrap();
    let inner = tx.transaction().await.unwrap();
    inner.commit().await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        driver.statements(),
        vec![
            "BEGIN",
            "SAVEPOINT fastpg_sp_1",
            "RELEASE SAVEPOINT fastpg_sp_1",
            "COMMIT",
        ]
    );
}

#[tokio::test]
async fn test_savepoint_names_stay_unique_within_connection() {
    let driver = MockDriver::new();
    let db = database(&driver);
    db.connect().await.unwrap();

    let mut conn = db.connection().await.unwrap();
    let mut tx = conn.transaction().await.unwrap();
    let first = tx.transaction().await.unwrap();
    first.commit().await.unwrap();
    let second = tx.transaction().await.unwrap();
    second.rollback().await.unwrap();
    tx.commit().await.unwrap();

    let statements = driver.statements();
    assert!(statements.contains(&"SAVEPOINT fastpg_sp_1".to_string()));
    assert!(statements.contains(&"SAVEPOINT fastpg_sp_2".to_string()));
}

#[tokio::test]
async fn test_dropped_scope_rolls_back_before_next_use() {
    let driver = MockDriver::new();
    let db = database(&driver);
    db.connect().await.unwrap();

    let mut conn = db.connection().await.unwrap();
    {
        let mut tx = conn.transaction().await.unwrap();
        tx.execute("insert into t (a) values (:a)", &named_args! { "a" => 1i64 })
            .await
            .unwrap();
        // dropped without commit or rollback
    }
    assert_eq!(conn.transaction_depth(), 0);

    conn.execute("select 1", &Default::default()).await.unwrap();

    assert_eq!(
        driver.statements(),
        vec![
            "BEGIN",
            "insert into t (a) values ($1)",
            "ROLLBACK",
            "select 1",
        ]
    );
}

#[tokio::test]
async fn test_dropped_inner_scope_rolls_back_to_savepoint_only() {
    let driver = MockDriver::new();
    let db = database(&driver);
    db.connect().await.unwrap();

    let mut conn = db.connection().await.unwrap();
    let mut tx = conn.transaction().await.unwrap();
    {
        let _inner = tx.transaction().await.unwrap();
        // dropped without commit or rollback
    }
    tx.execute("insert into t (a) values (:a)", &named_args! { "a" => 3i64 })
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        driver.statements(),
        vec![
            "BEGIN",
            "SAVEPOINT fastpg_sp_1",
            "ROLLBACK TO SAVEPOINT fastpg_sp_1",
            "RELEASE SAVEPOINT fastpg_sp_1",
            "insert into t (a) values ($1)",
            "COMMIT",
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_transaction_rolls_back_before_connection_reuse() {
    let driver = MockDriver::new();
    let db = database(&driver);
    db.connect().await.unwrap();

    {
        let mut conn = db.connection().await.unwrap();
        let mut tx = conn.transaction().await.unwrap();
        tx.execute("insert into t (a) values (:a)", &named_args! { "a" => 1i64 })
            .await
            .unwrap();
        // Both the scope and the handle drop with the transaction open;
        // release cleanup must roll back before the connection is idle
        // again.
    }

    let driver_watch = driver.clone();
    wait_for(move || driver_watch.statements().contains(&"ROLLBACK".to_string())).await;

    let statements = driver.statements();
    assert!(!statements.contains(&"COMMIT".to_string()));

    // And the connection is reusable afterwards.
    db.execute("select 1", &Default::default()).await.unwrap();
}

#[tokio::test]
async fn test_commit_failure_surfaces_depth() {
    let driver = MockDriver::new();
    driver.fail_on("COMMIT");
    let db = database(&driver);
    db.connect().await.unwrap();

    let mut conn = db.connection().await.unwrap();
    let tx = conn.transaction().await.unwrap();
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(TransactionError::CommitFailed { depth: 1, .. })
    ));
}

#[tokio::test]
async fn test_nested_rollback_failure_surfaces_depth() {
    let driver = MockDriver::new();
    driver.fail_on("ROLLBACK TO SAVEPOINT fastpg_sp_1");
    let db = database(&driver);
    db.connect().await.unwrap();

    let mut conn = db.connection().await.unwrap();
    let mut tx = conn.transaction().await.unwrap();
    let inner = tx.transaction().await.unwrap();
    let err = inner.rollback().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(TransactionError::RollbackFailed { depth: 2, .. })
    ));
}
