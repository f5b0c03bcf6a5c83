pub mod audit;
pub mod backup;
pub mod catalog;
pub mod commit;
pub mod config;
pub mod driver;
pub mod error;
pub mod preflight;
pub mod query;
pub mod snapshot;

use crate::audit::{AuditDispatcher, AuditSink};
use crate::catalog::schema::{CachedDatabaseSchema, DatabaseKind};
use crate::catalog::source::SourceMetadataProvider;
use crate::catalog::{DatabaseHandle, SchemaCache};
use crate::commit::executor::{Attempt, EditExecutor, ExecutorMetrics, run_blocking};
use crate::commit::tx::{EditRequest, EditResult, TransactionResult};
use crate::commit::validation::{ValidationResult, validate_edit, validate_read};
use crate::config::EngineConfig;
use crate::driver::StoreDriver;
use crate::error::EngineError;
use crate::query::executor::{QueryExplanation, explain, finish_read, prepare_read};
use crate::query::plan::{QueryRequest, QueryResult};
use crate::query::planner::suggest;
use crate::snapshot::gc::{GcResult, LeakWarning};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

pub use crate::catalog::types::Value;
pub use crate::query::plan::{Order, TableQuery, col, lit};

/// Creates a directory readable only by its owner (0o700 on Unix).
pub(crate) fn create_private_dir_all(path: &Path) -> Result<(), EngineError> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;
        use std::os::unix::fs::PermissionsExt;

        DirBuilder::new().recursive(true).mode(0o700).create(path)?;
        let metadata = fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(EngineError::Validation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }
        let mut perms = metadata.permissions();
        if perms.mode() & 0o777 != 0o700 {
            perms.set_mode(0o700);
            fs::set_permissions(path, perms)?;
        }
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Point-in-time counters across the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationalMetrics {
    pub registered_databases: u64,
    pub queries: u64,
    pub query_failures: u64,
    pub schema_loads: u64,
    pub schema_refreshes: u64,
    pub schema_load_failures: u64,
    pub schema_mismatch_retries: u64,
    pub edits_applied: u64,
    pub edits_rejected: u64,
    pub edits_failed: u64,
    pub dry_runs: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub transactions_failed: u64,
    pub backups_taken: u64,
    pub restores: u64,
    pub audit_delivered: u64,
    pub audit_failures: u64,
    pub queue_depth: u64,
}

#[derive(Debug, Default)]
struct QueryTelemetry {
    queries: AtomicU64,
    failures: AtomicU64,
    mismatch_retries: AtomicU64,
}

/// Schema-aware query and edit engine over registered relational stores.
///
/// One instance is shared by reference across request handlers. Reads run concurrently
/// against immutable schema snapshots; writes to one database are serialized through its
/// write queue while other databases proceed in parallel.
pub struct Engine {
    config: Arc<EngineConfig>,
    databases: RwLock<HashMap<String, DatabaseHandle>>,
    schemas: SchemaCache,
    executor: EditExecutor,
    audit: Arc<AuditDispatcher>,
    telemetry: QueryTelemetry,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);
        let audit = Arc::new(AuditDispatcher::new());
        Ok(Self {
            schemas: SchemaCache::new(None, config.schema_load_timeout()),
            executor: EditExecutor::new(Arc::clone(&config), Arc::clone(&audit)),
            databases: RwLock::new(HashMap::new()),
            audit,
            config,
            telemetry: QueryTelemetry::default(),
        })
    }

    /// Enriches schema snapshots with entity and property names from `provider`.
    ///
    /// Snapshots are built with the provider from the first load onwards, so this belongs
    /// to construction.
    pub fn with_source_metadata_provider(
        mut self,
        provider: Arc<dyn SourceMetadataProvider>,
    ) -> Self {
        self.schemas = SchemaCache::new(Some(provider), self.config.schema_load_timeout());
        self
    }

    pub fn with_audit_sink(self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit.add_sink(sink);
        self
    }

    pub fn add_audit_sink(&self, sink: Arc<dyn AuditSink>) {
        self.audit.add_sink(sink);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn register_database(
        &self,
        database_id: &str,
        kind: DatabaseKind,
        driver: Arc<dyn StoreDriver>,
    ) -> Result<(), EngineError> {
        if database_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "database id must not be empty".into(),
            ));
        }
        let mut databases = self.databases.write();
        if databases.contains_key(database_id) {
            return Err(EngineError::DatabaseAlreadyRegistered(
                database_id.to_string(),
            ));
        }
        let capabilities = driver.capabilities();
        databases.insert(
            database_id.to_string(),
            DatabaseHandle {
                database_id: database_id.to_string(),
                kind,
                driver,
            },
        );
        info!(
            database_id,
            kind = ?kind,
            savepoints = capabilities.savepoints,
            backup = capabilities.backup,
            "database registered"
        );
        Ok(())
    }

    /// Forgets a database, its cached schema and its write queue.
    ///
    /// Requests already holding the handle finish normally.
    pub fn unregister_database(&self, database_id: &str) -> Result<(), EngineError> {
        if self.databases.write().remove(database_id).is_none() {
            return Err(EngineError::database_not_found(database_id));
        }
        self.schemas.remove(database_id);
        self.executor.forget_database(database_id);
        info!(database_id, "database unregistered");
        Ok(())
    }

    pub fn database_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.databases.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn handle(&self, database_id: &str) -> Result<DatabaseHandle, EngineError> {
        self.databases
            .read()
            .get(database_id)
            .cloned()
            .ok_or_else(|| EngineError::database_not_found(database_id))
    }

    pub async fn get_or_load_schema(
        &self,
        database_id: &str,
    ) -> Result<Arc<CachedDatabaseSchema>, EngineError> {
        let handle = self.handle(database_id)?;
        self.schemas.get_or_load(&handle).await
    }

    /// Reloads the schema now. The new snapshot's version is strictly greater.
    pub async fn refresh_schema(
        &self,
        database_id: &str,
    ) -> Result<Arc<CachedDatabaseSchema>, EngineError> {
        let handle = self.handle(database_id)?;
        self.schemas.refresh(&handle).await
    }

    /// Drops the cached snapshot, e.g. after DDL run outside the engine.
    pub fn invalidate_schema(&self, database_id: &str) {
        self.schemas.invalidate(database_id);
    }

    async fn refresh_after_mismatch(
        &self,
        handle: &DatabaseHandle,
        detail: &str,
    ) -> Result<Arc<CachedDatabaseSchema>, EngineError> {
        self.telemetry.mismatch_retries.fetch_add(1, Ordering::Relaxed);
        warn!(
            database_id = %handle.database_id,
            detail,
            "schema looks stale, refreshing once"
        );
        self.schemas.refresh(handle).await
    }

    /// Checks a read against the current schema without touching the store.
    pub async fn validate_query(
        &self,
        request: &QueryRequest,
    ) -> Result<ValidationResult, EngineError> {
        let handle = self.handle(&request.database_id)?;
        let schema = self.schemas.get_or_load(&handle).await?;
        let (result, _) = validate_read(&request.source, &schema, &self.config);
        if !result.schema_mismatch {
            return Ok(result);
        }
        let schema = self.refresh_after_mismatch(&handle, &result.summary()).await?;
        Ok(validate_read(&request.source, &schema, &self.config).0)
    }

    pub async fn execute_query(&self, request: QueryRequest) -> Result<QueryResult, EngineError> {
        self.telemetry.queries.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = self.execute_query_inner(&request).await;
        match &result {
            Ok(page) => debug!(
                database_id = %request.database_id,
                rows = page.rows.len(),
                has_more = page.has_more,
                latency_ms = started.elapsed().as_millis() as u64,
                "query executed"
            ),
            Err(err) => {
                self.telemetry.failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    database_id = %request.database_id,
                    code = err.code_str(),
                    "query failed"
                );
            }
        }
        result
    }

    async fn execute_query_inner(&self, request: &QueryRequest) -> Result<QueryResult, EngineError> {
        let handle = self.handle(&request.database_id)?;
        let mut schema = self.schemas.get_or_load(&handle).await?;
        let mut refreshed = false;
        loop {
            match self.read_once(&handle, &schema, request).await? {
                Attempt::Done(result) => return Ok(result),
                Attempt::SchemaMismatch(detail) if !refreshed => {
                    schema = self.refresh_after_mismatch(&handle, &detail).await?;
                    refreshed = true;
                }
                Attempt::SchemaMismatch(detail) => {
                    return Err(EngineError::SchemaMismatch {
                        database_id: request.database_id.clone(),
                        detail,
                    });
                }
            }
        }
    }

    async fn read_once(
        &self,
        handle: &DatabaseHandle,
        schema: &CachedDatabaseSchema,
        request: &QueryRequest,
    ) -> Result<Attempt<QueryResult>, EngineError> {
        let (validation, shape) = validate_read(&request.source, schema, &self.config);
        if validation.schema_mismatch {
            return Ok(Attempt::SchemaMismatch(validation.summary()));
        }
        let shape = match shape {
            Some(shape) if validation.valid => shape,
            _ => return Err(EngineError::Validation(validation.summary())),
        };
        let prepared = prepare_read(&request.source, &request.page, shape, schema, &self.config)?;
        let deadline = request
            .deadline
            .unwrap_or_else(|| Instant::now() + self.config.statement_timeout());
        let driver = Arc::clone(&handle.driver);
        let sql = prepared.sql.clone();
        let params = prepared.params.clone();
        let rows = run_blocking(move || driver.query(&sql, &params, Some(deadline))).await?;
        match rows {
            Ok(rows) => Ok(Attempt::Done(finish_read(
                prepared,
                rows,
                schema,
                validation.warnings,
            )?)),
            Err(err) if err.is_schema_related() => Ok(Attempt::SchemaMismatch(err.to_string())),
            Err(err) => Err(err),
        }
    }

    /// Planner advice and the SQL a read would run, without running it.
    pub async fn explain_query(
        &self,
        request: &QueryRequest,
    ) -> Result<QueryExplanation, EngineError> {
        let handle = self.handle(&request.database_id)?;
        let schema = self.schemas.get_or_load(&handle).await?;
        let (validation, shape) = validate_read(&request.source, &schema, &self.config);
        let shape = match shape {
            Some(shape) if validation.valid => shape,
            _ => return Err(EngineError::Validation(validation.summary())),
        };
        let advice = suggest(&shape, &schema, &self.config);
        let prepared = prepare_read(&request.source, &request.page, shape, &schema, &self.config)?;
        Ok(explain(&prepared, advice))
    }

    /// Type and constraint checks for an edit, without probing or touching the store.
    pub async fn validate_edit(
        &self,
        request: &EditRequest,
    ) -> Result<ValidationResult, EngineError> {
        let handle = self.handle(&request.database_id)?;
        let window = self.executor.batch_window(request)?;
        let schema = self.schemas.get_or_load(&handle).await?;
        let (result, _) = validate_edit(request, &schema, &self.config, window.clone());
        if !result.schema_mismatch {
            return Ok(result);
        }
        let schema = self.refresh_after_mismatch(&handle, &result.summary()).await?;
        Ok(validate_edit(request, &schema, &self.config, window).0)
    }

    /// Applies one edit. Oversized batches apply one chunk and return a continuation token.
    pub async fn execute_edit(&self, request: EditRequest) -> Result<EditResult, EngineError> {
        let handle = self.handle(&request.database_id)?;
        let mut schema = self.schemas.get_or_load(&handle).await?;
        let mut refreshed = false;
        loop {
            match self.executor.execute_edit(&handle, schema, &request).await? {
                Attempt::Done(result) => return Ok(result),
                Attempt::SchemaMismatch(detail) if !refreshed => {
                    schema = self.refresh_after_mismatch(&handle, &detail).await?;
                    refreshed = true;
                }
                Attempt::SchemaMismatch(detail) => {
                    return Err(EngineError::SchemaMismatch {
                        database_id: request.database_id.clone(),
                        detail,
                    });
                }
            }
        }
    }

    /// Drives a batch through every continuation until it finishes or a chunk fails.
    ///
    /// Each chunk commits on its own; the results are returned in order. An error on the
    /// first chunk is returned as `Err`. After that, an error becomes a failed last
    /// result so the committed chunks stay visible.
    pub async fn execute_edit_all(
        &self,
        request: EditRequest,
    ) -> Result<Vec<EditResult>, EngineError> {
        let mut request = request;
        let mut results: Vec<EditResult> = Vec::new();
        loop {
            let result = match self.execute_edit(request.clone()).await {
                Ok(result) => result,
                Err(err) => match results.last() {
                    Some(previous) => {
                        warn!(
                            database_id = %request.database_id,
                            table = %request.table_name,
                            chunks_committed = results.len(),
                            error = %err,
                            "batch stopped after committed chunks"
                        );
                        let failed = EditResult::failed(&err, previous.schema_version);
                        results.push(failed);
                        return Ok(results);
                    }
                    None => return Err(err),
                },
            };
            let next = result.continuation_token.clone();
            let keep_going = result.success && result.has_more;
            results.push(result);
            match next {
                Some(token) if keep_going => {
                    request.config.continuation_token = Some(token);
                }
                _ => return Ok(results),
            }
        }
    }

    /// Like [`Engine::execute_transaction`], with every operation bounded by `deadline`.
    pub async fn execute_transaction_until(
        &self,
        mut operations: Vec<EditRequest>,
        deadline: Instant,
    ) -> Result<TransactionResult, EngineError> {
        for op in &mut operations {
            op.config.deadline = Some(op.config.deadline.map_or(deadline, |d| d.min(deadline)));
        }
        self.execute_transaction(operations).await
    }

    /// Applies every operation or none of them.
    ///
    /// The earliest operation deadline, if any, bounds the whole transaction.
    pub async fn execute_transaction(
        &self,
        operations: Vec<EditRequest>,
    ) -> Result<TransactionResult, EngineError> {
        let Some(database_id) = operations.first().map(|op| op.database_id.clone()) else {
            return Err(EngineError::Validation(
                "a transaction needs at least one operation".into(),
            ));
        };
        let handle = self.handle(&database_id)?;
        let mut schema = self.schemas.get_or_load(&handle).await?;
        let mut refreshed = false;
        loop {
            match self
                .executor
                .execute_transaction(&handle, schema, operations.clone())
                .await?
            {
                Attempt::Done(result) => return Ok(result),
                Attempt::SchemaMismatch(detail) if !refreshed => {
                    schema = self.refresh_after_mismatch(&handle, &detail).await?;
                    refreshed = true;
                }
                Attempt::SchemaMismatch(detail) => {
                    return Err(EngineError::SchemaMismatch {
                        database_id,
                        detail,
                    });
                }
            }
        }
    }

    /// Restores the tables a committed edit or transaction backed up beforehand.
    pub async fn rollback(&self, transaction_id: &str) -> Result<EditResult, EngineError> {
        let database_id = self.executor.journaled_database(transaction_id).ok_or_else(|| {
            EngineError::NotFound {
                resource_type: crate::error::ResourceType::Transaction,
                resource_id: transaction_id.to_string(),
            }
        })?;
        let handle = self.handle(&database_id)?;
        let result = self.executor.rollback(&handle, transaction_id).await?;
        // Restored rows may predate columns added since; reload on next access.
        self.schemas.invalidate(&database_id);
        Ok(result)
    }

    pub fn metrics(&self) -> OperationalMetrics {
        let cache = self.schemas.stats();
        let ExecutorMetrics {
            edits_applied,
            edits_rejected,
            edits_failed,
            dry_runs,
            transactions_committed,
            transactions_rolled_back,
            transactions_failed,
            backups_taken,
            restores,
            queue_depth,
        } = self.executor.metrics();
        OperationalMetrics {
            registered_databases: self.databases.read().len() as u64,
            queries: self.telemetry.queries.load(Ordering::Relaxed),
            query_failures: self.telemetry.failures.load(Ordering::Relaxed),
            schema_loads: cache.loads,
            schema_refreshes: cache.refreshes,
            schema_load_failures: cache.load_failures,
            schema_mismatch_retries: self.telemetry.mismatch_retries.load(Ordering::Relaxed),
            edits_applied,
            edits_rejected,
            edits_failed,
            dry_runs,
            transactions_committed,
            transactions_rolled_back,
            transactions_failed,
            backups_taken,
            restores,
            audit_delivered: self.audit.delivered(),
            audit_failures: self.audit.failures(),
            queue_depth,
        }
    }

    /// Releases bookkeeping for retired schema snapshots nobody holds any more.
    pub fn collect_garbage(&self) -> GcResult {
        self.schemas.gc()
    }

    /// Retired snapshots still held after `threshold_ms`.
    pub fn snapshot_leaks(&self, threshold_ms: u64) -> Vec<LeakWarning> {
        let leaks = self.schemas.check_leaks(threshold_ms);
        for leak in &leaks {
            warn!(
                database_id = %leak.database_id,
                schema_version = leak.schema_version,
                age_ms = leak.age.as_millis() as u64,
                holders = leak.holders,
                "retired schema snapshot still held"
            );
        }
        leaks
    }

    /// Waits until audit records emitted so far have reached the sinks.
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }
}
