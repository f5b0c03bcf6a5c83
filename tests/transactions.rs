use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use storebridge::catalog::schema::DatabaseKind;
use storebridge::catalog::types::Value;
use storebridge::commit::tx::{EditRequest, TransactionStatus, row};
use storebridge::config::EngineConfig;
use storebridge::driver::sqlite::SqliteDriver;
use storebridge::driver::{
    DriverCapabilities, RowSet, StoreCatalog, StoreDriver, WriteSession,
};
use storebridge::error::EngineError;
use storebridge::query::plan::{QueryRequest, col, lit};
use storebridge::Engine;
use tempfile::{TempDir, tempdir};

const LEDGER: &str =
    "CREATE TABLE ledger (id INTEGER PRIMARY KEY, label TEXT NOT NULL UNIQUE, amount INTEGER);";

/// SQLite underneath, with adjustable capabilities and a gate that holds the first
/// write session open until released.
struct GatedDriver {
    inner: SqliteDriver,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
    capabilities: DriverCapabilities,
}

impl GatedDriver {
    fn new(capabilities: DriverCapabilities) -> Self {
        let inner = SqliteDriver::open_in_memory().unwrap();
        inner.execute_batch(LEDGER).unwrap();
        Self {
            inner,
            gate: Mutex::new(None),
            capabilities,
        }
    }

    fn close_gate(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.gate.lock() = Some(rx);
        tx
    }
}

impl StoreDriver for GatedDriver {
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn introspect(&self, deadline: Option<Instant>) -> Result<StoreCatalog, EngineError> {
        self.inner.introspect(deadline)
    }

    fn query(
        &self,
        sql: &str,
        params: &[Value],
        deadline: Option<Instant>,
    ) -> Result<RowSet, EngineError> {
        self.inner.query(sql, params, deadline)
    }

    fn store_size_bytes(&self) -> Result<u64, EngineError> {
        self.inner.store_size_bytes()
    }

    fn with_write_session(
        &self,
        deadline: Option<Instant>,
        work: &mut dyn FnMut(&mut dyn WriteSession) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.inner.with_write_session(deadline, work)
    }
}

const FULL: DriverCapabilities = DriverCapabilities {
    savepoints: true,
    backup: true,
};

fn engine_over(driver: Arc<GatedDriver>, config: EngineConfig) -> (Arc<Engine>, TempDir) {
    let dir = tempdir().unwrap();
    let engine = Engine::new(config.with_backup_dir(dir.path())).unwrap();
    engine
        .register_database("ledger", DatabaseKind::DirectSql, driver)
        .unwrap();
    (Arc::new(engine), dir)
}

fn insert(label: &str) -> EditRequest {
    EditRequest::insert("ledger", "ledger", row([("label", lit(label))]))
}

async fn labels(engine: &Engine) -> Vec<Value> {
    engine
        .execute_query(QueryRequest::sql(
            "ledger",
            "SELECT label FROM ledger ORDER BY id",
            Vec::new(),
        ))
        .await
        .unwrap()
        .rows
        .into_iter()
        .map(|mut r| r.remove(0))
        .collect()
}

async fn wait_for_depth(engine: &Engine, depth: u64) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while engine.metrics().queue_depth < depth {
        assert!(Instant::now() < give_up, "queue never reached depth {depth}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_of_many_competing_transactions_commits_and_the_rest_leave_nothing() {
    let driver = Arc::new(GatedDriver::new(FULL));
    let (engine, _dir) = engine_over(driver, EngineConfig::default());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            engine
                .execute_transaction(vec![insert(&format!("own-{i}")), insert("shared")])
                .await
                .unwrap()
        }));
    }
    let mut committed = 0;
    for task in tasks {
        let result = task.await.unwrap();
        if result.success {
            committed += 1;
            assert_eq!(result.total_rows_affected, 2);
        } else {
            assert_eq!(result.status, TransactionStatus::RolledBack);
            assert_eq!(result.failed_operation_index, Some(1));
            assert_eq!(result.total_rows_affected, 0);
            assert!(result.per_operation_results.iter().all(|r| r.rows_affected == 0));
            assert!(result.per_operation_results[0]
                .warnings
                .iter()
                .any(|w| w.contains("rolled back")));
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(labels(&engine).await.len(), 2);
    let metrics = engine.metrics();
    assert_eq!(metrics.transactions_committed, 1);
    assert_eq!(metrics.transactions_rolled_back, 15);
    assert_eq!(metrics.queue_depth, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_writes_commit_in_slot_order() {
    let driver = Arc::new(GatedDriver::new(FULL));
    let release = driver.close_gate();
    let (engine, _dir) = engine_over(driver, EngineConfig::default());

    let mut tasks = Vec::new();
    for (depth, label) in [(1, "first"), (2, "second"), (3, "third")] {
        let worker = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            worker.execute_edit(insert(label)).await.unwrap()
        }));
        wait_for_depth(&engine, depth).await;
    }
    release.send(()).unwrap();
    for task in tasks {
        assert!(task.await.unwrap().success);
    }
    assert_eq!(
        labels(&engine).await,
        vec![Value::text("first"), Value::text("second"), Value::text("third")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_waiter_never_writes() {
    let driver = Arc::new(GatedDriver::new(FULL));
    let release = driver.close_gate();
    let (engine, _dir) = engine_over(driver, EngineConfig::default());

    let holder = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.execute_edit(insert("holder")).await.unwrap() })
    };
    wait_for_depth(&engine, 1).await;
    let waiter = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.execute_edit(insert("waiter")).await.unwrap() })
    };
    wait_for_depth(&engine, 2).await;

    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());
    wait_for_depth(&engine, 1).await;
    assert_eq!(engine.metrics().queue_depth, 1);

    release.send(()).unwrap();
    assert!(holder.await.unwrap().success);
    assert_eq!(labels(&engine).await, vec![Value::text("holder")]);
    assert_eq!(engine.metrics().queue_depth, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiting_past_the_queue_timeout_fails_the_edit() {
    let driver = Arc::new(GatedDriver::new(FULL));
    let release = driver.close_gate();
    let config = EngineConfig {
        queue_wait_timeout_ms: 50,
        ..EngineConfig::default()
    };
    let (engine, _dir) = engine_over(driver, config);

    let holder = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.execute_edit(insert("holder")).await.unwrap() })
    };
    wait_for_depth(&engine, 1).await;
    let late = engine.execute_edit(insert("late")).await.unwrap();
    assert!(!late.success);
    assert_eq!(late.failure.as_ref().map(|f| f.code.as_str()), Some("timeout"));

    release.send(()).unwrap();
    assert!(holder.await.unwrap().success);
    assert_eq!(labels(&engine).await, vec![Value::text("holder")]);
}

#[tokio::test]
async fn operations_run_in_submission_order() {
    let driver = Arc::new(GatedDriver::new(FULL));
    let (engine, _dir) = engine_over(driver, EngineConfig::default());
    let result = engine
        .execute_transaction(vec![
            insert("a"),
            EditRequest::update("ledger", "ledger", row([("amount", lit(5))]))
                .where_(col("label").eq(lit("a"))),
            EditRequest::update("ledger", "ledger", row([("label", lit("b"))]))
                .where_(col("amount").eq(lit(5))),
        ])
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    let rows: Vec<u64> = result
        .per_operation_results
        .iter()
        .map(|r| r.rows_affected)
        .collect();
    assert_eq!(rows, vec![1, 1, 1]);
    assert_eq!(labels(&engine).await, vec![Value::text("b")]);
}

#[tokio::test]
async fn validation_failure_stops_before_anything_runs() {
    let driver = Arc::new(GatedDriver::new(FULL));
    let (engine, _dir) = engine_over(driver, EngineConfig::default());
    let result = engine
        .execute_transaction(vec![
            insert("a"),
            EditRequest::delete("ledger", "ledger"),
            insert("c"),
        ])
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.status, TransactionStatus::Failed);
    assert_eq!(result.failed_operation_index, Some(1));
    assert_eq!(result.per_operation_results.len(), 2);
    assert!(labels(&engine).await.is_empty());
}

#[tokio::test]
async fn mixed_databases_and_dry_runs_are_refused() {
    let driver = Arc::new(GatedDriver::new(FULL));
    let (engine, _dir) = engine_over(driver, EngineConfig::default());
    let other = EditRequest::insert("elsewhere", "ledger", row([("label", lit("x"))]));
    let result = engine
        .execute_transaction(vec![insert("a"), other])
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.failed_operation_index, Some(1));

    let result = engine
        .execute_transaction(vec![insert("a").dry_run()])
        .await
        .unwrap();
    assert!(!result.success);
    assert!(labels(&engine).await.is_empty());
}

#[tokio::test]
async fn stores_without_savepoints_cannot_run_transactions() {
    let driver = Arc::new(GatedDriver::new(DriverCapabilities {
        savepoints: false,
        backup: false,
    }));
    let (engine, _dir) = engine_over(driver, EngineConfig::default());
    let err = engine
        .execute_transaction(vec![insert("a")])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unsupported(_)));

    // Single edits still work; a requested backup degrades to a warning.
    assert!(engine.execute_edit(insert("a")).await.unwrap().success);
    let updated = engine
        .execute_edit(
            EditRequest::update("ledger", "ledger", row([("amount", lit(1))]))
                .where_(col("label").eq(lit("a")))
                .auto_backup(),
        )
        .await
        .unwrap();
    assert!(updated.success);
    assert!(updated.backup_path.is_none());
    assert!(updated.transaction_id.is_none());
    assert!(updated.warnings.iter().any(|w| w.contains("cannot take backups")));
}

#[tokio::test]
async fn expired_deadline_fails_the_transaction_before_any_write() {
    let driver = Arc::new(GatedDriver::new(FULL));
    let (engine, _dir) = engine_over(driver, EngineConfig::default());
    let expired = Instant::now();
    let result = engine
        .execute_transaction(vec![
            insert("late-1").deadline(expired),
            insert("late-2"),
        ])
        .await
        .unwrap();
    assert!(!result.success);
    assert!(matches!(
        result.status,
        TransactionStatus::Failed | TransactionStatus::RolledBack
    ));
    let failure = result.per_operation_results[0].failure.as_ref().unwrap();
    assert_eq!(failure.code, "timeout");
    assert!(result.per_operation_results.iter().all(|r| r.rows_affected == 0));
    assert!(labels(&engine).await.is_empty());

    let result = engine
        .execute_transaction_until(vec![insert("late-3")], Instant::now())
        .await
        .unwrap();
    assert!(!result.success);
    assert!(labels(&engine).await.is_empty());
    assert_eq!(engine.metrics().transactions_committed, 0);
}

#[tokio::test]
async fn store_rejection_after_checks_pass_rolls_back_earlier_operations() {
    let driver = SqliteDriver::open_in_memory().unwrap();
    driver
        .execute_batch(
            "CREATE TABLE spans (id INTEGER PRIMARY KEY, lo INTEGER NOT NULL, hi INTEGER NOT NULL,
                                 CHECK (lo < hi));",
        )
        .unwrap();
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine
        .register_database("spans", DatabaseKind::DirectSql, Arc::new(driver))
        .unwrap();

    // Only `lo` is set, so the CHECK cannot be evaluated ahead of the write.
    let result = engine
        .execute_transaction(vec![
            EditRequest::insert(
                "spans",
                "spans",
                row([("id", lit(1)), ("lo", lit(1)), ("hi", lit(2))]),
            ),
            EditRequest::update("spans", "spans", row([("lo", lit(100))]))
                .where_(col("id").eq(lit(1))),
        ])
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.status, TransactionStatus::RolledBack);
    assert_eq!(result.failed_operation_index, Some(1));
    let failed = &result.per_operation_results[1];
    assert!(failed.constraint_violations.is_empty());
    assert_eq!(failed.failure.as_ref().unwrap().code, "execution");
    assert!(result.per_operation_results.iter().all(|r| r.rows_affected == 0));
    assert_eq!(result.total_rows_affected, 0);

    let count = engine
        .execute_query(QueryRequest::sql("spans", "SELECT COUNT(*) FROM spans", Vec::new()))
        .await
        .unwrap();
    assert_eq!(count.rows[0][0], Value::Integer(0));
}
