//! Edit execution and transaction management.
//!
//! Every write to a database goes through its [`queue::WriteQueue`] slot, then runs inside
//! one driver write session: backups first, then a savepoint, probes, statements, and
//! release or rollback. Nothing is left half-applied when control returns.

pub(crate) mod queue;

use crate::audit::{AuditDispatcher, AuditKind, AuditRecord};
use crate::backup::{BackupStore, manifest_path, verify_backup};
use crate::catalog::DatabaseHandle;
use crate::catalog::schema::{CachedDatabaseSchema, TableSchema};
use crate::commit::apply::{self, Statement};
use crate::commit::tx::{
    ConstraintViolation, EditFailure, EditRequest, EditResult, Transaction,
    TransactionResult,
};
use crate::commit::validation::{Probe, validate_edit};
use crate::config::EngineConfig;
use crate::driver::{BackupScope, WriteSession};
use crate::error::{EngineError, ResourceType};
use crate::preflight::{PreflightResult, preflight, run_probes};
use lru::LruCache;
use parking_lot::Mutex;
use queue::WriteQueue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

const EDIT_SAVEPOINT: &str = "storebridge_edit";

/// Outcome of one attempt against a schema snapshot.
///
/// `SchemaMismatch` means the snapshot looked stale: the caller refreshes and retries once.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    SchemaMismatch(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorMetrics {
    pub edits_applied: u64,
    pub edits_rejected: u64,
    pub edits_failed: u64,
    pub dry_runs: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub transactions_failed: u64,
    pub backups_taken: u64,
    pub restores: u64,
    pub queue_depth: u64,
}

#[derive(Debug, Default)]
struct ExecutorTelemetry {
    edits_applied: AtomicU64,
    edits_rejected: AtomicU64,
    edits_failed: AtomicU64,
    dry_runs: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    transactions_failed: AtomicU64,
    backups_taken: AtomicU64,
    restores: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Runs blocking store work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| EngineError::execution(format!("store task did not complete: {e}")))
}

/// Where an oversized batch resumes. Bound to the exact payload it was issued for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct BatchCursor {
    offset: usize,
    total: usize,
    digest: String,
}

fn batch_digest(request: &EditRequest) -> Result<String, EngineError> {
    let bytes = rmp_serde::to_vec(&(
        &request.database_id,
        &request.table_name,
        request.operation,
        &request.rows,
    ))
    .map_err(|e| EngineError::Encode(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn encode_cursor(cursor: &BatchCursor) -> Result<String, EngineError> {
    let bytes = rmp_serde::to_vec(cursor).map_err(|e| EngineError::Encode(e.to_string()))?;
    Ok(hex::encode(bytes))
}

fn decode_cursor(encoded: &str) -> Result<BatchCursor, EngineError> {
    let bytes = hex::decode(encoded)
        .map_err(|_| EngineError::InvalidContinuationToken("token is not valid hex".into()))?;
    rmp_serde::from_slice(&bytes)
        .map_err(|e| EngineError::InvalidContinuationToken(e.to_string()))
}

struct JournalEntry {
    database_id: String,
    /// Table to restore and the backup file holding its pre-transaction rows.
    restores: Vec<(String, PathBuf)>,
}

enum SessionOutcome {
    Applied {
        rows_affected: u64,
        last_insert_id: Option<i64>,
    },
    Rejected(Vec<ConstraintViolation>),
}

struct PlannedBackup {
    scope: BackupScope,
    path: PathBuf,
}

/// Probes first; statements only when every probe holds.
fn probe_and_execute(
    session: &mut dyn WriteSession,
    probes: &[Probe],
    statements: &[Statement],
) -> Result<SessionOutcome, EngineError> {
    let violations = run_probes(probes, |sql, params| session.query(sql, params))?;
    if !violations.is_empty() {
        return Ok(SessionOutcome::Rejected(violations));
    }
    let mut rows_affected = 0;
    let mut last_insert_id = None;
    for stmt in statements {
        let outcome = session.execute(&stmt.sql, &stmt.params)?;
        rows_affected += outcome.rows_affected;
        if outcome.last_insert_id.is_some() {
            last_insert_id = outcome.last_insert_id;
        }
    }
    Ok(SessionOutcome::Applied {
        rows_affected,
        last_insert_id,
    })
}

fn discard_backups(planned: &[PlannedBackup]) {
    for backup in planned {
        if backup.path.exists()
            && let Err(err) = std::fs::remove_file(&backup.path)
        {
            warn!(path = %backup.path.display(), error = %err, "failed to remove unused backup");
        }
    }
}

struct OpPlan {
    probes: Vec<Probe>,
    statements: Vec<Statement>,
}

enum OpFailure {
    Violations(Vec<ConstraintViolation>),
    Error(EngineError),
}

#[derive(Default)]
struct TxRun {
    backup_rows: Vec<Option<u64>>,
    applied: Vec<(u64, Option<i64>)>,
    failure: Option<(usize, OpFailure)>,
    savepoint_opened: bool,
}

pub struct EditExecutor {
    config: Arc<EngineConfig>,
    queue: WriteQueue,
    backups: BackupStore,
    journal: Mutex<LruCache<String, JournalEntry>>,
    audit: Arc<AuditDispatcher>,
    telemetry: ExecutorTelemetry,
}

impl EditExecutor {
    pub fn new(config: Arc<EngineConfig>, audit: Arc<AuditDispatcher>) -> Self {
        let capacity =
            NonZeroUsize::new(config.restore_journal_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backups: BackupStore::new(config.backup_dir.clone()),
            queue: WriteQueue::default(),
            journal: Mutex::new(LruCache::new(capacity)),
            audit,
            telemetry: ExecutorTelemetry::default(),
            config,
        }
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        let t = &self.telemetry;
        ExecutorMetrics {
            edits_applied: t.edits_applied.load(Ordering::Relaxed),
            edits_rejected: t.edits_rejected.load(Ordering::Relaxed),
            edits_failed: t.edits_failed.load(Ordering::Relaxed),
            dry_runs: t.dry_runs.load(Ordering::Relaxed),
            transactions_committed: t.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: t.transactions_rolled_back.load(Ordering::Relaxed),
            transactions_failed: t.transactions_failed.load(Ordering::Relaxed),
            backups_taken: t.backups_taken.load(Ordering::Relaxed),
            restores: t.restores.load(Ordering::Relaxed),
            queue_depth: self.queue.depth() as u64,
        }
    }

    pub(crate) fn forget_database(&self, database_id: &str) {
        self.queue.forget(database_id);
        let mut journal = self.journal.lock();
        let stale: Vec<String> = journal
            .iter()
            .filter(|(_, entry)| entry.database_id == database_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            journal.pop(&id);
        }
    }

    /// The database a journaled transaction wrote to, if it can still be rolled back.
    pub fn journaled_database(&self, transaction_id: &str) -> Option<String> {
        self.journal
            .lock()
            .peek(transaction_id)
            .map(|entry| entry.database_id.clone())
    }

    fn batch_cap(&self, request: &EditRequest) -> usize {
        request
            .config
            .max_batch_size
            .unwrap_or(self.config.max_batch_size)
            .max(1)
    }

    /// Rows of the batch this call covers, resuming from the continuation token.
    pub(crate) fn batch_window(&self, request: &EditRequest) -> Result<Range<usize>, EngineError> {
        let token = request.config.continuation_token.as_deref();
        if !request.operation.is_batch() {
            if token.is_some() {
                return Err(EngineError::InvalidContinuationToken(
                    "only batch operations continue".into(),
                ));
            }
            return Ok(0..0);
        }
        let total = request.rows.len();
        let start = match token {
            None => 0,
            Some(token) => {
                let cursor = decode_cursor(token)?;
                if cursor.total != total || cursor.digest != batch_digest(request)? {
                    return Err(EngineError::InvalidContinuationToken(
                        "token was issued for a different batch".into(),
                    ));
                }
                if cursor.offset == 0 || cursor.offset >= total {
                    return Err(EngineError::InvalidContinuationToken(
                        "token points outside the batch".into(),
                    ));
                }
                cursor.offset
            }
        };
        Ok(start..(start + self.batch_cap(request)).min(total))
    }

    fn continuation_after(
        &self,
        request: &EditRequest,
        window: &Range<usize>,
    ) -> Result<Option<String>, EngineError> {
        if !request.operation.is_batch() || window.end >= request.rows.len() {
            return Ok(None);
        }
        encode_cursor(&BatchCursor {
            offset: window.end,
            total: request.rows.len(),
            digest: batch_digest(request)?,
        })
        .map(Some)
    }

    fn deadline(&self, requested: Option<Instant>, with_backup: bool) -> Instant {
        requested.unwrap_or_else(|| {
            let mut budget = self.config.statement_timeout();
            if with_backup {
                budget += self.config.backup_timeout();
            }
            Instant::now() + budget
        })
    }

    /// Decides backup scope and allocates files; whole-database copies for small stores.
    async fn plan_backups(
        &self,
        handle: &DatabaseHandle,
        tables: &[String],
        warnings: &mut Vec<String>,
    ) -> Result<Vec<PlannedBackup>, EngineError> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        if !handle.driver.capabilities().backup {
            warnings.push(format!(
                "database {} cannot take backups; continuing without one",
                handle.database_id
            ));
            return Ok(Vec::new());
        }
        let driver = Arc::clone(&handle.driver);
        let size = run_blocking(move || driver.store_size_bytes()).await??;
        let scopes = if size <= self.config.whole_database_backup_max_bytes {
            vec![BackupScope::Database]
        } else {
            tables.iter().cloned().map(BackupScope::Table).collect()
        };
        scopes
            .into_iter()
            .map(|scope| {
                let path = self.backups.allocate(&handle.database_id, &scope)?;
                Ok(PlannedBackup { scope, path })
            })
            .collect()
    }

    /// Hashes written backups and journals them under `transaction_id`.
    fn seal_backups(
        &self,
        database_id: &str,
        transaction_id: &str,
        planned: &[PlannedBackup],
        rows: &[Option<u64>],
        tables: &[String],
        warnings: &mut Vec<String>,
    ) -> Vec<PathBuf> {
        let mut sealed = Vec::new();
        let mut restores = Vec::new();
        for (i, backup) in planned.iter().enumerate() {
            let row_count = rows.get(i).copied().flatten();
            match self
                .backups
                .seal(&backup.path, database_id, &backup.scope, Some(transaction_id), row_count)
            {
                Ok(manifest) => {
                    bump(&self.telemetry.backups_taken);
                    for table in tables.iter().filter(|t| manifest.covers(t)) {
                        restores.push((table.clone(), backup.path.clone()));
                    }
                    sealed.push(backup.path.clone());
                }
                Err(err) => {
                    warn!(database_id, error = %err, "backup could not be sealed");
                    warnings.push(format!("backup could not be sealed: {err}"));
                }
            }
        }
        if !restores.is_empty() {
            self.journal.lock().put(
                transaction_id.to_string(),
                JournalEntry {
                    database_id: database_id.to_string(),
                    restores,
                },
            );
        }
        sealed
    }

    fn failed_result(
        &self,
        err: &EngineError,
        version: u64,
        warnings: Vec<String>,
        started: Instant,
    ) -> EditResult {
        bump(&self.telemetry.edits_failed);
        EditResult {
            warnings,
            execution_time_ms: elapsed_ms(started),
            ..EditResult::failed(err, version)
        }
    }

    pub async fn execute_edit(
        &self,
        handle: &DatabaseHandle,
        schema: Arc<CachedDatabaseSchema>,
        request: &EditRequest,
    ) -> Result<Attempt<EditResult>, EngineError> {
        let started = Instant::now();
        let version = schema.schema_version;
        let window = self.batch_window(request)?;
        let (validation, probes) = validate_edit(request, &schema, &self.config, window.clone());
        if validation.schema_mismatch {
            return Ok(Attempt::SchemaMismatch(validation.summary()));
        }
        if !validation.valid {
            bump(&self.telemetry.edits_rejected);
            let mut result = EditResult::rejected(
                validation.errors,
                validation.constraint_violations,
                validation.warnings,
                version,
            );
            result.dry_run = request.config.dry_run;
            result.execution_time_ms = elapsed_ms(started);
            return Ok(Attempt::Done(result));
        }
        let table = schema
            .table(&request.table_name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                resource_type: ResourceType::Table,
                resource_id: request.table_name.clone(),
            })?;
        let mut warnings = validation.warnings;
        let continuation = self.continuation_after(request, &window)?;

        if request.config.dry_run {
            return self
                .dry_run(handle, request, table, probes, window, warnings, continuation, version, started)
                .await;
        }

        let _slot = match self
            .queue
            .acquire(&handle.database_id, self.config.queue_wait_timeout())
            .await
        {
            Ok(slot) => slot,
            Err(err) => return Ok(Attempt::Done(self.failed_result(&err, version, warnings, started))),
        };

        let backup_tables = if request.config.auto_backup && request.operation.is_destructive() {
            vec![table.name.clone()]
        } else {
            Vec::new()
        };
        let planned = match self.plan_backups(handle, &backup_tables, &mut warnings).await {
            Ok(planned) => planned,
            Err(err) => return Ok(Attempt::Done(self.failed_result(&err, version, warnings, started))),
        };
        let statements = apply::statements(request, &table, window.clone())?;
        let savepoint = ((request.config.transactional || request.operation.is_batch())
            && handle.driver.capabilities().savepoints)
            .then_some(EDIT_SAVEPOINT);
        let deadline = self.deadline(request.config.deadline, !planned.is_empty());
        let jobs: Vec<(BackupScope, PathBuf)> = planned
            .iter()
            .map(|b| (b.scope.clone(), b.path.clone()))
            .collect();
        let driver = Arc::clone(&handle.driver);

        let outcome = run_blocking(move || {
            let mut outcome = None;
            let mut backup_rows = Vec::new();
            driver.with_write_session(Some(deadline), &mut |session| {
                backup_rows.clear();
                for (scope, path) in &jobs {
                    backup_rows.push(session.backup(scope, path)?);
                }
                if let Some(name) = savepoint {
                    session.savepoint(name)?;
                }
                let result = probe_and_execute(session, &probes, &statements);
                if let Some(name) = savepoint {
                    match &result {
                        Ok(SessionOutcome::Applied { .. }) => session.release(name)?,
                        _ => {
                            if let Err(err) = session.rollback_to(name) {
                                warn!(error = %err, "rollback to savepoint failed");
                            }
                        }
                    }
                }
                outcome = Some(result?);
                Ok(())
            })?;
            let outcome =
                outcome.ok_or_else(|| EngineError::execution("write session did not run"))?;
            Ok::<_, EngineError>((outcome, backup_rows))
        })
        .await
        .and_then(|inner| inner);

        let result = match outcome {
            Ok((
                SessionOutcome::Applied {
                    rows_affected,
                    last_insert_id,
                },
                backup_rows,
            )) => {
                let transaction_id = uuid::Uuid::new_v4().to_string();
                let sealed = self.seal_backups(
                    &handle.database_id,
                    &transaction_id,
                    &planned,
                    &backup_rows,
                    &backup_tables,
                    &mut warnings,
                );
                let mut record = AuditRecord::new(AuditKind::Edit, &handle.database_id);
                record.tables = vec![table.name.clone()];
                record.operations = vec![request.operation.as_str().to_string()];
                record.rows_affected = rows_affected;
                record.backup_paths = sealed.iter().map(|p| p.display().to_string()).collect();
                if !sealed.is_empty() {
                    record.transaction_id = Some(transaction_id.clone());
                }
                let audit_id = self.audit.emit(record);
                bump(&self.telemetry.edits_applied);
                debug!(
                    database_id = %handle.database_id,
                    table = %table.name,
                    operation = request.operation.as_str(),
                    rows_affected,
                    "edit applied"
                );
                EditResult {
                    success: true,
                    rows_affected,
                    last_insert_id: last_insert_id.filter(|_| !request.operation.is_destructive()),
                    execution_time_ms: elapsed_ms(started),
                    backup_path: sealed.first().cloned(),
                    audit_id,
                    warnings,
                    has_more: continuation.is_some(),
                    continuation_token: continuation,
                    transaction_id: (!sealed.is_empty()).then_some(transaction_id),
                    schema_version: version,
                    ..EditResult::default()
                }
            }
            Ok((SessionOutcome::Rejected(violations), _)) => {
                discard_backups(&planned);
                bump(&self.telemetry.edits_rejected);
                let mut result = EditResult::rejected(Vec::new(), violations, warnings, version);
                result.execution_time_ms = elapsed_ms(started);
                result
            }
            Err(err) => {
                discard_backups(&planned);
                if err.is_schema_related() {
                    return Ok(Attempt::SchemaMismatch(err.to_string()));
                }
                warn!(
                    database_id = %handle.database_id,
                    table = %table.name,
                    error = %err,
                    "edit failed"
                );
                self.failed_result(&err, version, warnings, started)
            }
        };
        Ok(Attempt::Done(result))
    }

    #[allow(clippy::too_many_arguments)]
    async fn dry_run(
        &self,
        handle: &DatabaseHandle,
        request: &EditRequest,
        table: TableSchema,
        probes: Vec<Probe>,
        window: Range<usize>,
        warnings: Vec<String>,
        continuation: Option<String>,
        version: u64,
        started: Instant,
    ) -> Result<Attempt<EditResult>, EngineError> {
        bump(&self.telemetry.dry_runs);
        let driver = Arc::clone(&handle.driver);
        let deadline = self.deadline(request.config.deadline, false);
        let request = request.clone();
        let outcome = run_blocking(move || {
            preflight(&request, &table, &probes, window, |sql, params| {
                driver.query(sql, params, Some(deadline))
            })
        })
        .await
        .and_then(|inner| inner);
        let result = match outcome {
            Ok(PreflightResult::Ok { affected_rows }) => EditResult {
                success: true,
                dry_run: true,
                would_affect_rows: Some(affected_rows),
                warnings,
                has_more: continuation.is_some(),
                continuation_token: continuation,
                execution_time_ms: elapsed_ms(started),
                schema_version: version,
                ..EditResult::default()
            },
            Ok(PreflightResult::Rejected { violations }) => EditResult {
                dry_run: true,
                execution_time_ms: elapsed_ms(started),
                ..EditResult::rejected(Vec::new(), violations, warnings, version)
            },
            Err(err) if err.is_schema_related() => {
                return Ok(Attempt::SchemaMismatch(err.to_string()));
            }
            Err(err) => EditResult {
                dry_run: true,
                ..self.failed_result(&err, version, warnings, started)
            },
        };
        Ok(Attempt::Done(result))
    }

    fn transaction_result(
        tx: &Transaction,
        results: Vec<EditResult>,
        failed_operation_index: Option<usize>,
        started: Instant,
    ) -> TransactionResult {
        TransactionResult {
            transaction_id: tx.id.clone(),
            status: tx.status(),
            success: false,
            per_operation_results: results,
            total_rows_affected: 0,
            failed_operation_index,
            backup_paths: Vec::new(),
            audit_id: None,
            execution_time_ms: elapsed_ms(started),
        }
    }

    pub async fn execute_transaction(
        &self,
        handle: &DatabaseHandle,
        schema: Arc<CachedDatabaseSchema>,
        operations: Vec<EditRequest>,
    ) -> Result<Attempt<TransactionResult>, EngineError> {
        let started = Instant::now();
        if operations.is_empty() {
            return Err(EngineError::Validation(
                "a transaction needs at least one operation".into(),
            ));
        }
        if !handle.driver.capabilities().savepoints {
            return Err(EngineError::Unsupported(format!(
                "database {} has no savepoints, so transactions are unavailable",
                handle.database_id
            )));
        }
        let version = schema.schema_version;
        let mut tx = Transaction::new(operations);
        let mut results = Vec::with_capacity(tx.operations.len());
        let mut plans = Vec::with_capacity(tx.operations.len());
        let mut failed_validation = None;

        // Every operation is validated against the same snapshot before anything runs.
        for (index, op) in tx.operations.iter().enumerate() {
            let mut errors = Vec::new();
            if op.database_id != handle.database_id {
                errors.push(format!(
                    "operation targets database {}, transaction runs on {}",
                    op.database_id, handle.database_id
                ));
            }
            if op.config.dry_run {
                errors.push("dry runs cannot be part of a transaction".to_string());
            }
            if op.config.continuation_token.is_some() {
                errors.push("continuation tokens cannot be used inside a transaction".to_string());
            }
            let cap = self.batch_cap(op);
            if op.operation.is_batch() && op.rows.len() > cap {
                errors.push(format!(
                    "batch of {} rows exceeds the limit of {cap} inside a transaction",
                    op.rows.len()
                ));
            }
            let (validation, probes) = validate_edit(op, &schema, &self.config, 0..op.rows.len());
            if validation.schema_mismatch {
                return Ok(Attempt::SchemaMismatch(validation.summary()));
            }
            errors.extend(validation.errors);
            if !errors.is_empty() || !validation.constraint_violations.is_empty() {
                results.push(EditResult::rejected(
                    errors,
                    validation.constraint_violations,
                    validation.warnings,
                    version,
                ));
                failed_validation = Some(index);
                break;
            }
            let Some(table) = schema.table(&op.table_name) else {
                return Ok(Attempt::SchemaMismatch(format!("table '{}' not found", op.table_name)));
            };
            plans.push(OpPlan {
                probes,
                statements: apply::statements(op, table, 0..op.rows.len())?,
            });
            results.push(EditResult {
                warnings: validation.warnings,
                schema_version: version,
                ..EditResult::default()
            });
        }
        if let Some(index) = failed_validation {
            tx.fail()?;
            bump(&self.telemetry.transactions_failed);
            warn!(
                database_id = %handle.database_id,
                transaction_id = %tx.id,
                operation = index,
                "transaction rejected by validation"
            );
            return Ok(Attempt::Done(Self::transaction_result(&tx, results, Some(index), started)));
        }

        let backup_tables: Vec<String> = tx
            .operations
            .iter()
            .filter(|op| op.config.auto_backup && op.operation.is_destructive())
            .filter_map(|op| schema.table(&op.table_name).map(|t| t.name.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut warnings = Vec::new();

        let _slot = match self
            .queue
            .acquire(&handle.database_id, self.config.queue_wait_timeout())
            .await
        {
            Ok(slot) => slot,
            Err(err) => {
                tx.fail()?;
                bump(&self.telemetry.transactions_failed);
                results[0].failure = Some(EditFailure::from(&err));
                return Ok(Attempt::Done(Self::transaction_result(&tx, results, Some(0), started)));
            }
        };
        let planned = match self.plan_backups(handle, &backup_tables, &mut warnings).await {
            Ok(planned) => planned,
            Err(err) => {
                tx.fail()?;
                bump(&self.telemetry.transactions_failed);
                results[0].failure = Some(EditFailure::from(&err));
                return Ok(Attempt::Done(Self::transaction_result(&tx, results, Some(0), started)));
            }
        };
        for result in results.iter_mut() {
            result.warnings.extend(warnings.iter().cloned());
        }

        let savepoint = format!("storebridge_tx_{}", tx.id.replace('-', ""));
        tx.begin(savepoint.clone())?;
        // The earliest deadline among the operations bounds the whole unit.
        let requested = tx.operations.iter().filter_map(|op| op.config.deadline).min();
        let deadline = self.deadline(requested, !planned.is_empty());
        let jobs: Vec<(BackupScope, PathBuf)> = planned
            .iter()
            .map(|b| (b.scope.clone(), b.path.clone()))
            .collect();
        let driver = Arc::clone(&handle.driver);

        let (run, session_result) = run_blocking(move || {
            let mut run = TxRun::default();
            let session_result = driver.with_write_session(Some(deadline), &mut |session| {
                run = TxRun::default();
                for (scope, path) in &jobs {
                    run.backup_rows.push(session.backup(scope, path)?);
                }
                session.savepoint(&savepoint)?;
                run.savepoint_opened = true;
                for (index, plan) in plans.iter().enumerate() {
                    match probe_and_execute(session, &plan.probes, &plan.statements) {
                        Ok(SessionOutcome::Applied {
                            rows_affected,
                            last_insert_id,
                        }) => run.applied.push((rows_affected, last_insert_id)),
                        Ok(SessionOutcome::Rejected(violations)) => {
                            run.failure = Some((index, OpFailure::Violations(violations)));
                            break;
                        }
                        Err(err) => {
                            run.failure = Some((index, OpFailure::Error(err)));
                            break;
                        }
                    }
                }
                if run.failure.is_some() {
                    session.rollback_to(&savepoint)
                } else {
                    session.release(&savepoint)
                }
            });
            (run, session_result)
        })
        .await?;

        let failure = match (run.failure, session_result) {
            (Some(failure), _) => Some(failure),
            (None, Err(err)) => {
                let index = run.applied.len().min(results.len() - 1);
                Some((index, OpFailure::Error(err)))
            }
            (None, Ok(())) => None,
        };

        if let Some((index, failure)) = failure {
            discard_backups(&planned);
            if run.savepoint_opened {
                tx.roll_back()?;
                bump(&self.telemetry.transactions_rolled_back);
            } else {
                tx.fail()?;
                bump(&self.telemetry.transactions_failed);
            }
            for (i, result) in results.iter_mut().enumerate().take(index) {
                if i < run.applied.len() {
                    result
                        .warnings
                        .push("rolled back with the transaction".to_string());
                }
            }
            match failure {
                OpFailure::Violations(violations) => {
                    results[index].constraint_violations = violations;
                }
                OpFailure::Error(err) => {
                    if err.is_schema_related() {
                        return Ok(Attempt::SchemaMismatch(err.to_string()));
                    }
                    results[index].failure = Some(EditFailure::from(&err));
                }
            }
            warn!(
                database_id = %handle.database_id,
                transaction_id = %tx.id,
                operation = index,
                status = ?tx.status(),
                "transaction did not commit"
            );
            return Ok(Attempt::Done(Self::transaction_result(&tx, results, Some(index), started)));
        }

        tx.commit()?;
        bump(&self.telemetry.transactions_committed);
        let sealed = self.seal_backups(
            &handle.database_id,
            &tx.id,
            &planned,
            &run.backup_rows,
            &backup_tables,
            &mut warnings,
        );
        let mut total = 0;
        for ((result, (rows, last_insert_id)), op) in
            results.iter_mut().zip(run.applied).zip(&tx.operations)
        {
            total += rows;
            result.success = true;
            result.rows_affected = rows;
            result.last_insert_id = last_insert_id.filter(|_| !op.operation.is_destructive());
            result.transaction_id = Some(tx.id.clone());
        }
        let mut record = AuditRecord::new(AuditKind::Transaction, &handle.database_id);
        record.tables = tx.operations.iter().map(|op| op.table_name.clone()).collect();
        record.operations = tx
            .operations
            .iter()
            .map(|op| op.operation.as_str().to_string())
            .collect();
        record.rows_affected = total;
        record.transaction_id = Some(tx.id.clone());
        record.backup_paths = sealed.iter().map(|p| p.display().to_string()).collect();
        let audit_id = self.audit.emit(record);
        for result in results.iter_mut() {
            result.audit_id = audit_id.clone();
        }
        info!(
            database_id = %handle.database_id,
            transaction_id = %tx.id,
            operations = tx.operations.len(),
            rows_affected = total,
            "transaction committed"
        );
        Ok(Attempt::Done(TransactionResult {
            transaction_id: tx.id.clone(),
            status: tx.status(),
            success: true,
            per_operation_results: results,
            total_rows_affected: total,
            failed_operation_index: None,
            backup_paths: sealed,
            audit_id,
            execution_time_ms: elapsed_ms(started),
        }))
    }

    /// Restores every table a committed edit or transaction backed up.
    pub async fn rollback(
        &self,
        handle: &DatabaseHandle,
        transaction_id: &str,
    ) -> Result<EditResult, EngineError> {
        let started = Instant::now();
        let not_found = || EngineError::NotFound {
            resource_type: ResourceType::Transaction,
            resource_id: transaction_id.to_string(),
        };
        let entry = self.journal.lock().pop(transaction_id).ok_or_else(not_found)?;
        let restore_entry = |entry: JournalEntry| {
            self.journal.lock().put(transaction_id.to_string(), entry);
        };
        if entry.database_id != handle.database_id {
            restore_entry(entry);
            return Err(not_found());
        }
        let files: BTreeSet<PathBuf> = entry.restores.iter().map(|(_, p)| p.clone()).collect();
        for path in &files {
            if let Err(err) = verify_backup(&manifest_path(path)) {
                restore_entry(entry);
                return Err(err);
            }
        }
        let _slot = match self
            .queue
            .acquire(&handle.database_id, self.config.queue_wait_timeout())
            .await
        {
            Ok(slot) => slot,
            Err(err) => {
                restore_entry(entry);
                return Err(err);
            }
        };
        let jobs = entry.restores.clone();
        let driver = Arc::clone(&handle.driver);
        let deadline = Instant::now() + self.config.backup_timeout();
        let restored = run_blocking(move || {
            let mut total = 0;
            driver
                .with_write_session(Some(deadline), &mut |session| {
                    total = 0;
                    for (table, path) in &jobs {
                        total += session.restore_table(table, path)?;
                    }
                    Ok(())
                })
                .map(|_| total)
        })
        .await
        .and_then(|inner| inner);

        match restored {
            Ok(rows) => {
                bump(&self.telemetry.restores);
                let mut record = AuditRecord::new(AuditKind::Rollback, &handle.database_id);
                record.tables = entry.restores.iter().map(|(t, _)| t.clone()).collect();
                record.operations = vec!["rollback".to_string()];
                record.rows_affected = rows;
                record.transaction_id = Some(transaction_id.to_string());
                record.backup_paths = entry
                    .restores
                    .iter()
                    .map(|(_, p)| p.display().to_string())
                    .collect();
                let audit_id = self.audit.emit(record);
                warn!(
                    database_id = %handle.database_id,
                    transaction_id,
                    rows_restored = rows,
                    "committed changes rolled back from backup"
                );
                Ok(EditResult {
                    success: true,
                    rows_affected: rows,
                    execution_time_ms: elapsed_ms(started),
                    backup_path: entry.restores.first().map(|(_, p)| p.clone()),
                    audit_id,
                    transaction_id: Some(transaction_id.to_string()),
                    ..EditResult::default()
                })
            }
            Err(err) => {
                warn!(
                    database_id = %handle.database_id,
                    transaction_id,
                    error = %err,
                    "rollback from backup failed"
                );
                restore_entry(entry);
                Ok(self.failed_result(&err, 0, Vec::new(), started))
            }
        }
    }
}
