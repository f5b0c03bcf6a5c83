use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use storebridge::Engine;
use storebridge::catalog::schema::DatabaseKind;
use storebridge::catalog::types::Value;
use storebridge::config::EngineConfig;
use storebridge::driver::sqlite::SqliteDriver;
use storebridge::driver::{DriverCapabilities, RowSet, StoreCatalog, StoreDriver, WriteSession};
use storebridge::error::EngineError;

/// Counts introspections and can be made slow.
struct CountingDriver {
    inner: SqliteDriver,
    introspections: AtomicUsize,
    delay: Duration,
}

impl CountingDriver {
    fn new(delay: Duration) -> Self {
        let inner = SqliteDriver::open_in_memory().unwrap();
        inner
            .execute_batch(
                "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL);
                 CREATE TABLE entries (
                     id INTEGER PRIMARY KEY,
                     account_id INTEGER NOT NULL REFERENCES accounts(id),
                     cents INTEGER NOT NULL
                 );
                 CREATE INDEX entries_account ON entries (account_id);
                 CREATE VIEW balances AS
                     SELECT account_id, SUM(cents) AS cents FROM entries GROUP BY account_id;",
            )
            .unwrap();
        Self {
            inner,
            introspections: AtomicUsize::new(0),
            delay,
        }
    }
}

impl StoreDriver for CountingDriver {
    fn capabilities(&self) -> DriverCapabilities {
        self.inner.capabilities()
    }

    fn introspect(&self, deadline: Option<Instant>) -> Result<StoreCatalog, EngineError> {
        self.introspections.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
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
        self.inner.with_write_session(deadline, work)
    }
}

fn engine(driver: Arc<CountingDriver>, config: EngineConfig) -> Arc<Engine> {
    let engine = Engine::new(config).unwrap();
    engine
        .register_database("books", DatabaseKind::DirectSql, driver)
        .unwrap();
    Arc::new(engine)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_introspect_once() {
    let driver = Arc::new(CountingDriver::new(Duration::from_millis(30)));
    let engine = engine(driver.clone(), EngineConfig::default());
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            engine.get_or_load_schema("books").await.unwrap()
        }));
    }
    let mut snapshots = Vec::new();
    for task in tasks {
        snapshots.push(task.await.unwrap());
    }
    assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
    assert_eq!(driver.introspections.load(Ordering::SeqCst), 1);
    assert_eq!(engine.metrics().schema_loads, 1);
}

#[tokio::test]
async fn snapshot_describes_tables_views_indexes_and_keys() {
    let driver = Arc::new(CountingDriver::new(Duration::ZERO));
    let engine = engine(driver, EngineConfig::default());
    let schema = engine.get_or_load_schema("books").await.unwrap();

    let entries = schema.table("ENTRIES").expect("lookup ignores case");
    assert!(entries.primary_key.contains("id"));
    assert!(schema.indexes.iter().any(|i| i.name == "entries_account"));
    assert!(schema
        .foreign_keys
        .iter()
        .any(|fk| fk.from_table == "entries" && fk.to_table == "accounts"));
    assert!(schema.view("balances").is_some());
    assert!(schema.table("balances").is_none());
}

#[tokio::test]
async fn invalidate_reloads_with_a_higher_version() {
    let driver = Arc::new(CountingDriver::new(Duration::ZERO));
    let engine = engine(driver.clone(), EngineConfig::default());
    let v1 = engine.get_or_load_schema("books").await.unwrap();
    engine.invalidate_schema("books");
    let v2 = engine.get_or_load_schema("books").await.unwrap();
    assert!(v2.schema_version > v1.schema_version);
    assert!(!Arc::ptr_eq(&v1, &v2));
    assert_eq!(driver.introspections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn slow_introspection_is_schema_unavailable() {
    let driver = Arc::new(CountingDriver::new(Duration::from_millis(300)));
    let config = EngineConfig {
        schema_load_timeout_ms: 20,
        ..EngineConfig::default()
    };
    let engine = engine(driver, config);
    let err = engine.get_or_load_schema("books").await.unwrap_err();
    assert!(matches!(err, EngineError::SchemaUnavailable { .. }));
    assert_eq!(engine.metrics().schema_load_failures, 1);
}

#[tokio::test]
async fn retired_snapshot_lives_as_long_as_its_holder() {
    let driver = Arc::new(CountingDriver::new(Duration::ZERO));
    let engine = engine(driver, EngineConfig::default());
    let held = engine.get_or_load_schema("books").await.unwrap();
    let fresh = engine.refresh_schema("books").await.unwrap();
    assert!(fresh.schema_version > held.schema_version);

    let leaks = engine.snapshot_leaks(0);
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].schema_version, held.schema_version);
    // Still usable by the request that holds it.
    assert!(held.table("accounts").is_some());

    drop(held);
    let gc = engine.collect_garbage();
    assert_eq!(gc.reclaimed_snapshots, 1);
    assert!(engine.snapshot_leaks(0).is_empty());
}
