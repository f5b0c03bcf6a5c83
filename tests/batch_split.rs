use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use storebridge::catalog::schema::DatabaseKind;
use storebridge::commit::tx::{EditRequest, RowData, row};
use storebridge::config::EngineConfig;
use storebridge::driver::{DriverCapabilities, RowSet, StoreCatalog, StoreDriver, WriteSession};
use storebridge::driver::sqlite::SqliteDriver;
use storebridge::error::EngineError;
use storebridge::query::plan::lit;
use storebridge::{Engine, Value};
use tempfile::{TempDir, tempdir};

fn setup(max_batch_size: usize) -> (Engine, Arc<SqliteDriver>, TempDir) {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        max_batch_size,
        ..EngineConfig::default()
    }
    .with_backup_dir(dir.path());
    let engine = Engine::new(config).unwrap();
    let driver = Arc::new(SqliteDriver::open_in_memory().unwrap());
    driver
        .execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, n INTEGER NOT NULL);")
        .unwrap();
    engine
        .register_database("inv", DatabaseKind::DirectSql, driver.clone())
        .unwrap();
    (engine, driver, dir)
}

fn payload(count: i64) -> Vec<RowData> {
    (0..count).map(|n| row([("n", lit(n))])).collect()
}

fn stored(driver: &SqliteDriver) -> i64 {
    driver
        .query("SELECT COUNT(*) FROM items", &[], None)
        .unwrap()
        .rows[0][0]
        .as_i64()
        .unwrap()
}

#[tokio::test]
async fn oversized_insert_runs_in_three_chunks() {
    let (engine, driver, _dir) = setup(1000);
    let request = EditRequest::batch_insert("inv", "items", payload(2500));

    let first = engine.execute_edit(request.clone()).await.unwrap();
    assert!(first.success, "{first:?}");
    assert_eq!(first.rows_affected, 1000);
    assert!(first.has_more);
    let token = first.continuation_token.clone().expect("token after the first chunk");
    assert_eq!(stored(&driver), 1000);

    let second = engine
        .execute_edit(request.clone().continuation(Some(token)))
        .await
        .unwrap();
    assert_eq!(second.rows_affected, 1000);
    assert!(second.has_more);

    let third = engine
        .execute_edit(request.clone().continuation(second.continuation_token.clone()))
        .await
        .unwrap();
    assert_eq!(third.rows_affected, 500);
    assert!(!third.has_more);
    assert!(third.continuation_token.is_none());

    assert_eq!(
        first.rows_affected + second.rows_affected + third.rows_affected,
        2500
    );
    assert_eq!(stored(&driver), 2500);
}

#[tokio::test]
async fn execute_edit_all_drives_the_batch_to_completion() {
    let (engine, driver, _dir) = setup(1000);
    let results = engine
        .execute_edit_all(EditRequest::batch_insert("inv", "items", payload(2500)))
        .await
        .unwrap();
    let chunks: Vec<u64> = results.iter().map(|r| r.rows_affected).collect();
    assert_eq!(chunks, vec![1000, 1000, 500]);
    assert_eq!(stored(&driver), 2500);
}

#[tokio::test]
async fn per_request_cap_overrides_the_engine_default() {
    let (engine, driver, _dir) = setup(1000);
    let results = engine
        .execute_edit_all(EditRequest::batch_insert("inv", "items", payload(10)).max_batch_size(4))
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(stored(&driver), 10);
}

#[tokio::test]
async fn continuation_tokens_are_bound_to_their_payload() {
    let (engine, driver, _dir) = setup(100);
    let request = EditRequest::batch_insert("inv", "items", payload(250));
    let first = engine.execute_edit(request).await.unwrap();
    let token = first.continuation_token.clone().unwrap();

    let other = EditRequest::batch_insert("inv", "items", payload(251)).continuation(Some(token));
    assert!(matches!(
        engine.execute_edit(other).await,
        Err(EngineError::InvalidContinuationToken(_))
    ));

    let garbage = EditRequest::batch_insert("inv", "items", payload(250))
        .continuation(Some("not-a-token".into()));
    let err = engine.execute_edit(garbage).await.unwrap_err();
    assert_eq!(err.code_str(), "invalid_continuation_token");
    assert_eq!(stored(&driver), 100);
}

#[tokio::test]
async fn a_rejected_chunk_stops_the_drive_and_keeps_earlier_chunks() {
    let (engine, driver, _dir) = setup(3);
    let mut rows = payload(8);
    rows[4] = row([("n", lit("four"))]);
    let results = engine
        .execute_edit_all(EditRequest::batch_insert("inv", "items", rows))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].success);
    assert!(!results[1].success);
    assert_eq!(results[1].constraint_violations[0].row_index, Some(4));
    assert_eq!(stored(&driver), 3);
}

#[tokio::test]
async fn batch_update_and_delete_address_rows_by_key() {
    let (engine, driver, _dir) = setup(1000);
    engine
        .execute_edit_all(EditRequest::batch_insert("inv", "items", payload(5)))
        .await
        .unwrap();
    let updated = engine
        .execute_edit(EditRequest::batch_update(
            "inv",
            "items",
            vec![
                row([("id", lit(1)), ("n", lit(100))]),
                row([("id", lit(2)), ("n", lit(200))]),
            ],
        ))
        .await
        .unwrap();
    assert!(updated.success, "{updated:?}");
    assert_eq!(updated.rows_affected, 2);

    let missing_key = engine
        .execute_edit(EditRequest::batch_delete(
            "inv",
            "items",
            vec![row([("n", lit(100))])],
        ))
        .await
        .unwrap();
    assert!(!missing_key.success);

    let deleted = engine
        .execute_edit(EditRequest::batch_delete(
            "inv",
            "items",
            vec![row([("id", lit(1))]), row([("id", lit(3))]), row([("id", lit(99))])],
        ))
        .await
        .unwrap();
    assert!(deleted.success);
    assert_eq!(deleted.rows_affected, 2);
    assert_eq!(stored(&driver), 3);
}

#[tokio::test]
async fn oversized_batch_inside_a_transaction_is_refused() {
    let (engine, driver, _dir) = setup(10);
    let result = engine
        .execute_transaction(vec![EditRequest::batch_insert("inv", "items", payload(11))])
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.per_operation_results[0]
        .validation_errors
        .iter()
        .any(|e| e.contains("exceeds")));
    assert_eq!(stored(&driver), 0);
}

/// Accepts one write session, then reports the table as gone on every later one.
struct VanishingTable {
    inner: SqliteDriver,
    sessions: AtomicUsize,
}

impl StoreDriver for VanishingTable {
    fn capabilities(&self) -> DriverCapabilities {
        self.inner.capabilities()
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
        if self.sessions.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(EngineError::Execution {
                message: "no such table: items".into(),
                schema_related: true,
                constraint: false,
            });
        }
        self.inner.with_write_session(deadline, work)
    }
}

#[tokio::test]
async fn error_after_committed_chunks_keeps_their_results() {
    let inner = SqliteDriver::open_in_memory().unwrap();
    inner
        .execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, n INTEGER NOT NULL);")
        .unwrap();
    let driver = Arc::new(VanishingTable {
        inner,
        sessions: AtomicUsize::new(0),
    });
    let dir = tempdir().unwrap();
    let engine = Engine::new(EngineConfig::default().with_backup_dir(dir.path())).unwrap();
    engine
        .register_database("inv", DatabaseKind::DirectSql, driver.clone())
        .unwrap();

    let results = engine
        .execute_edit_all(EditRequest::batch_insert("inv", "items", payload(2500)))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].success);
    assert_eq!(results[0].rows_affected, 1000);
    assert!(!results[1].success);
    assert_eq!(results[1].failure.as_ref().unwrap().code, "schema_mismatch");
    assert_eq!(stored(&driver.inner), 1000);
}
