use crate::catalog::types::Value;
use crate::error::EngineError;
use crate::query::plan::{Expr, WhereClause};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

/// Column name to value, as supplied by the caller.
pub type RowData = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EditOperation {
    Insert,
    Update,
    Delete,
    BatchInsert,
    BatchUpdate,
    BatchDelete,
}

impl EditOperation {
    pub fn is_batch(self) -> bool {
        matches!(
            self,
            EditOperation::BatchInsert | EditOperation::BatchUpdate | EditOperation::BatchDelete
        )
    }

    /// Operations that change or remove existing rows, and so get a backup first.
    pub fn is_destructive(self) -> bool {
        !matches!(self, EditOperation::Insert | EditOperation::BatchInsert)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EditOperation::Insert => "insert",
            EditOperation::Update => "update",
            EditOperation::Delete => "delete",
            EditOperation::BatchInsert => "batch_insert",
            EditOperation::BatchUpdate => "batch_update",
            EditOperation::BatchDelete => "batch_delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditConfig {
    /// Wrap the statement(s) in a savepoint.
    pub transactional: bool,
    pub dry_run: bool,
    pub auto_backup: bool,
    /// Overrides the engine's batch cap for this request.
    pub max_batch_size: Option<usize>,
    /// Allows Update/Delete without a where clause.
    pub affect_all_rows: bool,
    /// Resumes an oversized batch where the previous call stopped.
    pub continuation_token: Option<String>,
    pub deadline: Option<Instant>,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            transactional: true,
            dry_run: false,
            auto_backup: false,
            max_batch_size: None,
            affect_all_rows: false,
            continuation_token: None,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditRequest {
    pub database_id: String,
    pub operation: EditOperation,
    pub table_name: String,
    /// Insert values, or the SET list of an Update.
    pub data: RowData,
    /// Batch payload. BatchUpdate and BatchDelete rows carry the primary key.
    pub rows: Vec<RowData>,
    pub filter: Option<WhereClause>,
    pub config: EditConfig,
}

impl EditRequest {
    fn new(database_id: &str, operation: EditOperation, table: &str) -> Self {
        Self {
            database_id: database_id.to_string(),
            operation,
            table_name: table.to_string(),
            data: RowData::new(),
            rows: Vec::new(),
            filter: None,
            config: EditConfig::default(),
        }
    }

    pub fn insert(database_id: &str, table: &str, data: RowData) -> Self {
        Self {
            data,
            ..Self::new(database_id, EditOperation::Insert, table)
        }
    }

    pub fn update(database_id: &str, table: &str, data: RowData) -> Self {
        Self {
            data,
            ..Self::new(database_id, EditOperation::Update, table)
        }
    }

    pub fn delete(database_id: &str, table: &str) -> Self {
        Self::new(database_id, EditOperation::Delete, table)
    }

    pub fn batch_insert(database_id: &str, table: &str, rows: Vec<RowData>) -> Self {
        Self {
            rows,
            ..Self::new(database_id, EditOperation::BatchInsert, table)
        }
    }

    pub fn batch_update(database_id: &str, table: &str, rows: Vec<RowData>) -> Self {
        Self {
            rows,
            ..Self::new(database_id, EditOperation::BatchUpdate, table)
        }
    }

    pub fn batch_delete(database_id: &str, table: &str, rows: Vec<RowData>) -> Self {
        Self {
            rows,
            ..Self::new(database_id, EditOperation::BatchDelete, table)
        }
    }

    pub fn where_(mut self, expr: Expr) -> Self {
        self.filter = Some(WhereClause::Expr(expr));
        self
    }

    pub fn where_raw(mut self, sql: &str, args: Vec<Value>) -> Self {
        self.filter = Some(WhereClause::raw(sql, args));
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.config.dry_run = true;
        self
    }

    pub fn auto_backup(mut self) -> Self {
        self.config.auto_backup = true;
        self
    }

    pub fn affect_all_rows(mut self) -> Self {
        self.config.affect_all_rows = true;
        self
    }

    pub fn non_transactional(mut self) -> Self {
        self.config.transactional = false;
        self
    }

    pub fn max_batch_size(mut self, n: usize) -> Self {
        self.config.max_batch_size = Some(n);
        self
    }

    pub fn continuation(mut self, token: Option<String>) -> Self {
        self.config.continuation_token = token;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.config.deadline = Some(deadline);
        self
    }

    /// Rows the request writes: the batch length, or 1.
    pub fn row_count(&self) -> usize {
        if self.operation.is_batch() {
            self.rows.len()
        } else {
            1
        }
    }
}

/// Builds a [`RowData`] from `(column, value)` pairs.
pub fn row<I, K, V>(pairs: I) -> RowData
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConstraintType {
    PrimaryKey,
    ForeignKey,
    Unique,
    Check,
    NotNull,
    DataType,
    /// Update/Delete with no where clause and no explicit override.
    UnscopedMutation,
}

impl ConstraintType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConstraintType::PrimaryKey => "primary_key",
            ConstraintType::ForeignKey => "foreign_key",
            ConstraintType::Unique => "unique",
            ConstraintType::Check => "check",
            ConstraintType::NotNull => "not_null",
            ConstraintType::DataType => "data_type",
            ConstraintType::UnscopedMutation => "unscoped_mutation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConstraintViolation {
    pub constraint_type: ConstraintType,
    pub table: String,
    pub column: Option<String>,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    /// `Entity.property: Type` when source metadata names the column.
    pub source_property: Option<String>,
    /// Position in the batch for batch operations.
    pub row_index: Option<usize>,
}

impl ConstraintViolation {
    pub fn new(constraint_type: ConstraintType, table: &str, message: impl Into<String>) -> Self {
        Self {
            constraint_type,
            table: table.to_string(),
            column: None,
            message: message.into(),
            expected: None,
            actual: None,
            source_property: None,
            row_index: None,
        }
    }

    pub fn column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    pub fn row_index(mut self, index: Option<usize>) -> Self {
        self.row_index = index;
        self
    }
}

/// Why an executed edit did not succeed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditFailure {
    /// Stable code from [`crate::error::EngineErrorCode`].
    pub code: String,
    pub message: String,
}

impl From<&EngineError> for EditFailure {
    fn from(err: &EngineError) -> Self {
        Self {
            code: err.code_str().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditResult {
    pub success: bool,
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
    pub execution_time_ms: u64,
    pub backup_path: Option<PathBuf>,
    pub validation_errors: Vec<String>,
    pub constraint_violations: Vec<ConstraintViolation>,
    pub audit_id: Option<String>,
    pub warnings: Vec<String>,
    pub dry_run: bool,
    /// Dry runs: rows the edit would touch.
    pub would_affect_rows: Option<u64>,
    pub has_more: bool,
    pub continuation_token: Option<String>,
    /// Handle for [`crate::Engine::rollback`] when a backup was taken.
    pub transaction_id: Option<String>,
    pub failure: Option<EditFailure>,
    pub schema_version: u64,
}

impl EditResult {
    pub fn rejected(
        validation_errors: Vec<String>,
        constraint_violations: Vec<ConstraintViolation>,
        warnings: Vec<String>,
        schema_version: u64,
    ) -> Self {
        Self {
            validation_errors,
            constraint_violations,
            warnings,
            schema_version,
            ..Self::default()
        }
    }

    pub fn failed(err: &EngineError, schema_version: u64) -> Self {
        Self {
            failure: Some(EditFailure::from(err)),
            schema_version,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Executing,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack | TransactionStatus::Failed
        )
    }
}

/// A multi-operation write unit. Lives only for the duration of one call.
#[derive(Debug)]
pub struct Transaction {
    pub id: String,
    pub operations: Vec<EditRequest>,
    status: TransactionStatus,
    /// Savepoint name inside the store while executing.
    pub rollback_point: Option<String>,
}

impl Transaction {
    pub fn new(operations: Vec<EditRequest>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operations,
            status: TransactionStatus::Pending,
            rollback_point: None,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    fn transition(&mut self, to: TransactionStatus) -> Result<(), EngineError> {
        let allowed = matches!(
            (self.status, to),
            (TransactionStatus::Pending, TransactionStatus::Executing)
                | (TransactionStatus::Pending, TransactionStatus::Failed)
                | (TransactionStatus::Executing, TransactionStatus::Committed)
                | (TransactionStatus::Executing, TransactionStatus::RolledBack)
                | (TransactionStatus::Executing, TransactionStatus::Failed)
        );
        if !allowed {
            return Err(EngineError::Validation(format!(
                "transaction {} cannot move from {:?} to {:?}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    pub fn begin(&mut self, savepoint: String) -> Result<(), EngineError> {
        self.transition(TransactionStatus::Executing)?;
        self.rollback_point = Some(savepoint);
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), EngineError> {
        self.transition(TransactionStatus::Committed)
    }

    pub fn roll_back(&mut self) -> Result<(), EngineError> {
        self.transition(TransactionStatus::RolledBack)
    }

    pub fn fail(&mut self) -> Result<(), EngineError> {
        self.transition(TransactionStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub status: TransactionStatus,
    pub success: bool,
    pub per_operation_results: Vec<EditResult>,
    /// Rows that stayed written; 0 unless the transaction committed.
    pub total_rows_affected: u64,
    pub failed_operation_index: Option<usize>,
    pub backup_paths: Vec<PathBuf>,
    pub audit_id: Option<String>,
    pub execution_time_ms: u64,
}
