pub mod sqlite;

use crate::catalog::types::{Row, Value};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    /// 1-based position inside the primary key, 0 when not part of it.
    pub pk_position: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIndex {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    /// `c` (CREATE INDEX), `u` (UNIQUE constraint) or `pk`.
    pub origin: String,
    pub where_clause: Option<String>,
    pub cardinality: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawForeignKey {
    pub from_columns: Vec<String>,
    pub to_table: String,
    pub to_columns: Vec<String>,
    pub on_delete: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub name: String,
    pub create_sql: Option<String>,
    pub columns: Vec<RawColumn>,
    pub indexes: Vec<RawIndex>,
    pub foreign_keys: Vec<RawForeignKey>,
    pub row_count: Option<u64>,
    pub without_rowid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawView {
    pub name: String,
    pub sql: String,
}

/// What a driver found in the store's catalog, before any engine interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCatalog {
    pub tables: Vec<RawTable>,
    pub views: Vec<RawView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub declared_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub savepoints: bool,
    pub backup: bool,
}

/// Where a backup copies data from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupScope {
    Table(String),
    Database,
}

/// Exclusive access to the store for the duration of one write unit.
///
/// Every call honours the deadline given when the session was opened.
pub trait WriteSession {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome, EngineError>;
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<RowSet, EngineError>;
    fn savepoint(&mut self, name: &str) -> Result<(), EngineError>;
    fn release(&mut self, name: &str) -> Result<(), EngineError>;
    fn rollback_to(&mut self, name: &str) -> Result<(), EngineError>;
    /// Copies `scope` into a new store file at `dest`.
    ///
    /// Returns the number of rows copied for table backups.
    fn backup(&mut self, scope: &BackupScope, dest: &Path) -> Result<Option<u64>, EngineError>;
    /// Replaces the contents of `table` with the copy held in the backup at `src`.
    fn restore_table(&mut self, table: &str, src: &Path) -> Result<u64, EngineError>;
}

/// The relational store underneath the engine.
///
/// Calls are blocking; the engine runs them on the blocking pool.
pub trait StoreDriver: Send + Sync + 'static {
    fn capabilities(&self) -> DriverCapabilities;

    fn introspect(&self, deadline: Option<Instant>) -> Result<StoreCatalog, EngineError>;

    fn query(
        &self,
        sql: &str,
        params: &[Value],
        deadline: Option<Instant>,
    ) -> Result<RowSet, EngineError>;

    fn store_size_bytes(&self) -> Result<u64, EngineError>;

    /// Runs `work` with exclusive write access.
    fn with_write_session(
        &self,
        deadline: Option<Instant>,
        work: &mut dyn FnMut(&mut dyn WriteSession) -> Result<(), EngineError>,
    ) -> Result<(), EngineError>;
}

/// Quotes an identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::quote_ident;

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
