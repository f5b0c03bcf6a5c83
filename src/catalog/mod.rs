pub mod loader;
pub mod schema;
pub mod source;
pub mod types;

use crate::catalog::loader::build_snapshot;
use crate::catalog::schema::{CachedDatabaseSchema, DatabaseKind};
use crate::catalog::source::SourceMetadataProvider;
use crate::driver::StoreDriver;
use crate::error::EngineError;
use crate::snapshot::gc::{GcResult, LeakWarning, RetiredSnapshots};
use im::HashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap as StdHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A registered database: its identity, flavour and the driver that reaches it.
#[derive(Clone)]
pub struct DatabaseHandle {
    pub database_id: String,
    pub kind: DatabaseKind,
    pub driver: Arc<dyn StoreDriver>,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("database_id", &self.database_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaCacheStats {
    pub loads: u64,
    pub refreshes: u64,
    pub load_failures: u64,
}

/// Versioned, copy-on-refresh schema snapshots per database.
///
/// Readers clone an `Arc` out of the map and never observe a snapshot change. A refresh
/// builds a new snapshot and swaps the map entry; the old one lives until its last holder
/// drops it.
pub struct SchemaCache {
    snapshots: RwLock<HashMap<String, Arc<CachedDatabaseSchema>>>,
    /// Survives `invalidate`, so versions only ever grow.
    versions: Mutex<StdHashMap<String, u64>>,
    /// Serializes loads of one database so concurrent misses introspect once.
    load_gates: Mutex<StdHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    retired: Mutex<RetiredSnapshots>,
    source_provider: Option<Arc<dyn SourceMetadataProvider>>,
    load_timeout: Duration,
    loads: AtomicU64,
    refreshes: AtomicU64,
    load_failures: AtomicU64,
}

impl SchemaCache {
    pub fn new(
        source_provider: Option<Arc<dyn SourceMetadataProvider>>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            versions: Mutex::new(StdHashMap::new()),
            load_gates: Mutex::new(StdHashMap::new()),
            retired: Mutex::new(RetiredSnapshots::default()),
            source_provider,
            load_timeout,
            loads: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
        }
    }

    pub fn cached(&self, database_id: &str) -> Option<Arc<CachedDatabaseSchema>> {
        self.snapshots.read().get(database_id).cloned()
    }

    pub async fn get_or_load(
        &self,
        db: &DatabaseHandle,
    ) -> Result<Arc<CachedDatabaseSchema>, EngineError> {
        if let Some(snapshot) = self.cached(&db.database_id) {
            return Ok(snapshot);
        }
        let gate = self.load_gate(&db.database_id);
        let _loading = gate.lock().await;
        if let Some(snapshot) = self.cached(&db.database_id) {
            return Ok(snapshot);
        }
        let snapshot = self.load(db).await?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        info!(
            database_id = %db.database_id,
            schema_version = snapshot.schema_version,
            tables = snapshot.tables.len(),
            "schema loaded"
        );
        Ok(snapshot)
    }

    /// Reloads unconditionally. The returned snapshot has a strictly greater version.
    pub async fn refresh(
        &self,
        db: &DatabaseHandle,
    ) -> Result<Arc<CachedDatabaseSchema>, EngineError> {
        let gate = self.load_gate(&db.database_id);
        let _loading = gate.lock().await;
        let snapshot = self.load(db).await?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        info!(
            database_id = %db.database_id,
            schema_version = snapshot.schema_version,
            "schema refreshed"
        );
        Ok(snapshot)
    }

    /// Drops the cached snapshot; the next access reloads it.
    pub fn invalidate(&self, database_id: &str) {
        let removed = {
            let mut snapshots = self.snapshots.write();
            let removed = snapshots.get(database_id).cloned();
            *snapshots = snapshots.without(database_id);
            removed
        };
        if let Some(old) = removed {
            self.retired.lock().retire(&old);
            debug!(database_id, schema_version = old.schema_version, "schema invalidated");
        }
    }

    /// Forgets everything about a database, including its version counter.
    pub fn remove(&self, database_id: &str) {
        self.invalidate(database_id);
        self.versions.lock().remove(database_id);
        self.load_gates.lock().remove(database_id);
    }

    pub fn stats(&self) -> SchemaCacheStats {
        SchemaCacheStats {
            loads: self.loads.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
        }
    }

    pub fn gc(&self) -> GcResult {
        self.retired.lock().gc()
    }

    pub fn check_leaks(&self, threshold_ms: u64) -> Vec<LeakWarning> {
        self.retired.lock().check_leaks(threshold_ms)
    }

    fn load_gate(&self, database_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.load_gates
            .lock()
            .entry(database_id.to_string())
            .or_default()
            .clone()
    }

    async fn load(&self, db: &DatabaseHandle) -> Result<Arc<CachedDatabaseSchema>, EngineError> {
        let deadline = Instant::now() + self.load_timeout;
        let driver = Arc::clone(&db.driver);
        let provider = self.source_provider.clone();
        let database_id = db.database_id.clone();
        let introspection = tokio::task::spawn_blocking(move || {
            let catalog = driver.introspect(Some(deadline))?;
            let entities = match &provider {
                Some(provider) => match provider.entities(&database_id) {
                    Ok(entities) => entities,
                    Err(err) => {
                        warn!(database_id = %database_id, error = %err, "source metadata unavailable");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            Ok::<_, EngineError>((catalog, entities))
        });
        let outcome = match tokio::time::timeout(self.load_timeout, introspection).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::execution(format!(
                "schema load task failed: {join_err}"
            ))),
            Err(_) => Err(EngineError::Timeout {
                phase: "schema load",
            }),
        };
        let (catalog, entities) = match outcome {
            Ok(loaded) => loaded,
            Err(err) => {
                self.load_failures.fetch_add(1, Ordering::Relaxed);
                warn!(database_id = %db.database_id, error = %err, "schema load failed");
                return Err(EngineError::SchemaUnavailable {
                    database_id: db.database_id.clone(),
                    message: err.to_string(),
                });
            }
        };

        let version = {
            let mut versions = self.versions.lock();
            let next = versions.get(&db.database_id).copied().unwrap_or(0) + 1;
            versions.insert(db.database_id.clone(), next);
            next
        };
        let snapshot = Arc::new(build_snapshot(
            &db.database_id,
            db.kind,
            catalog,
            entities,
            version,
            now_micros(),
        ));
        let previous = {
            let mut snapshots = self.snapshots.write();
            let previous = snapshots.get(&db.database_id).cloned();
            *snapshots = snapshots.update(db.database_id.clone(), Arc::clone(&snapshot));
            previous
        };
        if let Some(old) = previous {
            let mut retired = self.retired.lock();
            retired.retire(&old);
            retired.gc();
        }
        Ok(snapshot)
    }
}

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
