use crate::catalog::types::Value;
use crate::driver::{
    BackupScope, DriverCapabilities, ExecOutcome, RawColumn, RawForeignKey, RawIndex, RawTable,
    RawView, ResultColumn, RowSet, StoreCatalog, StoreDriver, WriteSession, quote_ident,
};
use crate::error::EngineError;
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, OpenFlags, OptionalExtension, ToSql, params_from_iter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

const BACKUP_SCHEMA: &str = "storebridge_backup";
const BACKUP_ROWID_COLUMN: &str = "__storebridge_rowid";
/// VM instructions between deadline checks.
const PROGRESS_OPS: i32 = 1_000;
const BUSY_TIMEOUT_MS: u64 = 5_000;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as SqlValue;
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Boolean(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(bytes) => Value::text(String::from_utf8_lossy(bytes).as_ref()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

/// SQLite store driver.
///
/// File-backed stores get a dedicated reader connection so reads never wait on the
/// writer (WAL mode). In-memory stores share one connection.
pub struct SqliteDriver {
    path: Option<PathBuf>,
    writer: Arc<Mutex<Connection>>,
    reader: Option<Mutex<Connection>>,
}

impl SqliteDriver {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let writer = Connection::open(&path)?;
        configure_writer(&writer)?;
        writer.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        let reader = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(Self {
            path: Some(path),
            writer: Arc::new(Mutex::new(writer)),
            reader: Some(Mutex::new(reader)),
        })
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        configure_writer(&conn)?;
        Ok(Self {
            path: None,
            writer: Arc::new(Mutex::new(conn)),
            reader: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs raw SQL on the writer connection, outside the engine. Meant for fixtures
    /// and operator tooling.
    pub fn execute_batch(&self, sql: &str) -> Result<(), EngineError> {
        self.writer.lock().execute_batch(sql)?;
        Ok(())
    }

    fn with_reader<T>(
        &self,
        deadline: Option<Instant>,
        f: impl FnOnce(&Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        match &self.reader {
            Some(reader) => {
                let conn = reader.lock();
                let _armed = DeadlineGuard::arm(&conn, deadline)?;
                f(&conn)
            }
            None => {
                let conn = self.writer.lock();
                let _armed = DeadlineGuard::arm(&conn, deadline)?;
                f(&conn)
            }
        }
    }
}

fn configure_writer(conn: &Connection) -> Result<(), EngineError> {
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

/// Interrupts statements running past `deadline` and disarms on drop.
struct DeadlineGuard<'a> {
    conn: &'a Connection,
}

impl<'a> DeadlineGuard<'a> {
    fn arm(conn: &'a Connection, deadline: Option<Instant>) -> Result<Self, EngineError> {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout { phase: "statement" });
            }
            conn.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
        }
        Ok(Self { conn })
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(PROGRESS_OPS, None::<fn() -> bool>);
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> Result<RowSet, EngineError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<ResultColumn> = stmt
        .columns()
        .iter()
        .map(|c| ResultColumn {
            name: c.name().to_string(),
            declared_type: c.decl_type().map(str::to_string),
        })
        .collect();
    let width = columns.len();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(value_from_ref(row.get_ref(i)?));
        }
        out.push(values);
    }
    Ok(RowSet { columns, rows: out })
}

fn run_execute(conn: &Connection, sql: &str, params: &[Value]) -> Result<ExecOutcome, EngineError> {
    let changed = conn.execute(sql, params_from_iter(params.iter()))?;
    let is_insert = sql
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("INSERT"));
    Ok(ExecOutcome {
        rows_affected: changed as u64,
        last_insert_id: is_insert.then(|| conn.last_insert_rowid()),
    })
}

fn introspect(conn: &Connection) -> Result<StoreCatalog, EngineError> {
    let mut catalog = StoreCatalog::default();
    let has_stat1: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_stat1'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    let mut stmt = conn.prepare(
        "SELECT name, type, sql FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let entries = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (name, kind, sql) in entries {
        if kind == "view" {
            catalog.views.push(RawView {
                name,
                sql: sql.unwrap_or_default(),
            });
            continue;
        }
        let without_rowid = sql
            .as_deref()
            .is_some_and(|s| s.to_ascii_uppercase().contains("WITHOUT ROWID"));
        let columns = table_columns(conn, &name)?;
        let indexes = table_indexes(conn, &name, has_stat1)?;
        let foreign_keys = table_foreign_keys(conn, &name)?;
        let row_count = table_row_count(conn, &name, has_stat1)?;
        catalog.tables.push(RawTable {
            name,
            create_sql: sql,
            columns,
            indexes,
            foreign_keys,
            row_count,
            without_rowid,
        });
    }
    Ok(catalog)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<RawColumn>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map([table], |row| {
            Ok(RawColumn {
                name: row.get(0)?,
                declared_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                not_null: row.get::<_, i64>(2)? != 0,
                default_value: row.get(3)?,
                pk_position: row.get::<_, i64>(4)?.max(0) as u32,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn table_indexes(
    conn: &Connection,
    table: &str,
    has_stat1: bool,
) -> Result<Vec<RawIndex>, EngineError> {
    let mut list = conn.prepare(
        "SELECT name, \"unique\", origin, partial FROM pragma_index_list(?1) ORDER BY seq",
    )?;
    let entries = list
        .query_map([table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut info =
        conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let mut out = Vec::with_capacity(entries.len());
    for (name, unique, origin, partial) in entries {
        let columns = info
            .query_map([&name], |row| {
                Ok(row
                    .get::<_, Option<String>>(0)?
                    .unwrap_or_else(|| "<expr>".to_string()))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let where_clause = if partial {
            index_where_clause(conn, &name)?
        } else {
            None
        };
        let cardinality = if has_stat1 {
            index_cardinality(conn, table, &name)?
        } else {
            None
        };
        out.push(RawIndex {
            name,
            columns,
            unique,
            origin,
            where_clause,
            cardinality,
        });
    }
    Ok(out)
}

fn index_where_clause(conn: &Connection, index: &str) -> Result<Option<String>, EngineError> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [index],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(sql.and_then(|sql| {
        let upper = sql.to_ascii_uppercase();
        upper
            .rfind(" WHERE ")
            .map(|pos| sql[pos + " WHERE ".len()..].trim().to_string())
    }))
}

/// Parses `sqlite_stat1.stat` ("rows avg-per-key ...") into distinct keys.
fn index_cardinality(
    conn: &Connection,
    table: &str,
    index: &str,
) -> Result<Option<u64>, EngineError> {
    let stat: Option<String> = conn
        .query_row(
            "SELECT stat FROM sqlite_stat1 WHERE tbl = ?1 AND idx = ?2",
            [table, index],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stat.and_then(|stat| {
        let mut parts = stat.split_whitespace().map(|p| p.parse::<u64>().ok());
        let rows = parts.next().flatten()?;
        let per_key = parts.next().flatten()?.max(1);
        Some(rows / per_key)
    }))
}

fn table_row_count(
    conn: &Connection,
    table: &str,
    has_stat1: bool,
) -> Result<Option<u64>, EngineError> {
    if has_stat1 {
        let stat: Option<String> = conn
            .query_row(
                "SELECT stat FROM sqlite_stat1 WHERE tbl = ?1 LIMIT 1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(rows) = stat
            .as_deref()
            .and_then(|s| s.split_whitespace().next())
            .and_then(|n| n.parse::<u64>().ok())
        {
            return Ok(Some(rows));
        }
    }
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )?;
    Ok(Some(count.max(0) as u64))
}

fn table_foreign_keys(conn: &Connection, table: &str) -> Result<Vec<RawForeignKey>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, \"table\", \"from\", \"to\", on_delete \
         FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    let rows = stmt
        .query_map([table], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out: Vec<(i64, RawForeignKey)> = Vec::new();
    for (id, to_table, from, to, on_delete) in rows {
        match out.last_mut() {
            Some((last_id, fk)) if *last_id == id => {
                fk.from_columns.push(from);
                if let Some(to) = to {
                    fk.to_columns.push(to);
                }
            }
            _ => out.push((
                id,
                RawForeignKey {
                    from_columns: vec![from],
                    to_table,
                    to_columns: to.into_iter().collect(),
                    on_delete,
                },
            )),
        }
    }
    Ok(out.into_iter().map(|(_, fk)| fk).collect())
}

impl StoreDriver for SqliteDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            savepoints: true,
            backup: true,
        }
    }

    fn introspect(&self, deadline: Option<Instant>) -> Result<StoreCatalog, EngineError> {
        self.with_reader(deadline, introspect)
    }

    fn query(
        &self,
        sql: &str,
        params: &[Value],
        deadline: Option<Instant>,
    ) -> Result<RowSet, EngineError> {
        self.with_reader(deadline, |conn| run_query(conn, sql, params))
    }

    fn store_size_bytes(&self) -> Result<u64, EngineError> {
        self.with_reader(None, |conn| {
            let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            Ok((pages.max(0) as u64).saturating_mul(page_size.max(0) as u64))
        })
    }

    fn with_write_session(
        &self,
        deadline: Option<Instant>,
        work: &mut dyn FnMut(&mut dyn WriteSession) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let conn = self.writer.lock();
        let result = {
            let _armed = DeadlineGuard::arm(&conn, deadline)?;
            let mut session = SqliteSession { conn: &conn };
            work(&mut session)
        };
        if !conn.is_autocommit() {
            warn!("write session left a transaction open; rolling back");
            conn.execute_batch("ROLLBACK")?;
        }
        result
    }
}

struct SqliteSession<'a> {
    conn: &'a Connection,
}

impl SqliteSession<'_> {
    fn attach(&self, path: &Path) -> Result<(), EngineError> {
        let path = path
            .to_str()
            .ok_or_else(|| EngineError::Backup(format!("non-utf8 path {}", path.display())))?;
        self.conn.execute(
            &format!("ATTACH DATABASE ?1 AS {BACKUP_SCHEMA}"),
            [path],
        )?;
        Ok(())
    }

    fn detach(&self) {
        if let Err(err) = self
            .conn
            .execute_batch(&format!("DETACH DATABASE {BACKUP_SCHEMA}"))
        {
            warn!(error = %err, "failed to detach backup store");
        }
    }

    fn copy_table_out(&self, table: &str) -> Result<u64, EngineError> {
        let has_rowid = !self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get::<_, Option<String>>(0),
            )?
            .unwrap_or_default()
            .to_ascii_uppercase()
            .contains("WITHOUT ROWID");
        let quoted = quote_ident(table);
        let select = if has_rowid {
            format!("SELECT rowid AS {BACKUP_ROWID_COLUMN}, * FROM main.{quoted}")
        } else {
            format!("SELECT * FROM main.{quoted}")
        };
        self.conn.execute_batch(&format!(
            "CREATE TABLE {BACKUP_SCHEMA}.{quoted} AS {select}"
        ))?;
        let rows: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {BACKUP_SCHEMA}.{quoted}"),
            [],
            |row| row.get(0),
        )?;
        Ok(rows.max(0) as u64)
    }

    fn copy_table_in(&self, table: &str) -> Result<u64, EngineError> {
        let quoted = quote_ident(table);
        let backup_columns = run_query(
            self.conn,
            &format!("PRAGMA {BACKUP_SCHEMA}.table_info({quoted})"),
            &[],
        )?;
        if backup_columns.rows.is_empty() {
            return Err(EngineError::Backup(format!(
                "backup does not contain table '{table}'"
            )));
        }
        let live = table_columns(self.conn, table)?;
        // An INTEGER PRIMARY KEY column already is the rowid.
        let mut key_columns = live.iter().filter(|c| c.pk_position > 0);
        let rowid_alias = matches!(
            (key_columns.next(), key_columns.next()),
            (Some(key), None) if key.declared_type.eq_ignore_ascii_case("INTEGER")
        );
        let carries_rowid = !rowid_alias
            && backup_columns.rows.iter().any(
                |row| matches!(row.get(1), Some(Value::Text(name)) if name.as_str() == BACKUP_ROWID_COLUMN),
            );
        let live_columns: Vec<String> = live.iter().map(|c| quote_ident(&c.name)).collect();
        let column_list = live_columns.join(", ");
        let (target, source) = if carries_rowid {
            (
                format!("rowid, {column_list}"),
                format!("{BACKUP_ROWID_COLUMN}, {column_list}"),
            )
        } else {
            (column_list.clone(), column_list)
        };
        self.conn.execute_batch("PRAGMA defer_foreign_keys = ON")?;
        self.conn
            .execute(&format!("DELETE FROM main.{quoted}"), [])?;
        let restored = self.conn.execute(
            &format!(
                "INSERT INTO main.{quoted} ({target}) SELECT {source} FROM {BACKUP_SCHEMA}.{quoted}"
            ),
            [],
        )?;
        Ok(restored as u64)
    }
}

impl WriteSession for SqliteSession<'_> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome, EngineError> {
        debug!(sql, params = params.len(), "execute");
        run_execute(self.conn, sql, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<RowSet, EngineError> {
        run_query(self.conn, sql, params)
    }

    fn savepoint(&mut self, name: &str) -> Result<(), EngineError> {
        self.conn
            .execute_batch(&format!("SAVEPOINT {}", quote_ident(name)))?;
        Ok(())
    }

    fn release(&mut self, name: &str) -> Result<(), EngineError> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT {}", quote_ident(name)))?;
        Ok(())
    }

    fn rollback_to(&mut self, name: &str) -> Result<(), EngineError> {
        let quoted = quote_ident(name);
        self.conn.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {quoted}; RELEASE SAVEPOINT {quoted}"
        ))?;
        Ok(())
    }

    fn backup(&mut self, scope: &BackupScope, dest: &Path) -> Result<Option<u64>, EngineError> {
        if dest.exists() {
            return Err(EngineError::Backup(format!(
                "backup target {} already exists",
                dest.display()
            )));
        }
        match scope {
            BackupScope::Database => {
                let path = dest.to_str().ok_or_else(|| {
                    EngineError::Backup(format!("non-utf8 path {}", dest.display()))
                })?;
                self.conn.execute("VACUUM INTO ?1", [path])?;
                Ok(None)
            }
            BackupScope::Table(table) => {
                self.attach(dest)?;
                let copied = self.copy_table_out(table);
                self.detach();
                copied.map(Some)
            }
        }
    }

    fn restore_table(&mut self, table: &str, src: &Path) -> Result<u64, EngineError> {
        if !src.exists() {
            return Err(EngineError::Backup(format!(
                "backup {} does not exist",
                src.display()
            )));
        }
        self.attach(src)?;
        let result = (|| {
            self.savepoint("storebridge_restore")?;
            match self.copy_table_in(table) {
                Ok(rows) => {
                    self.release("storebridge_restore")?;
                    Ok(rows)
                }
                Err(err) => {
                    self.rollback_to("storebridge_restore")?;
                    Err(err)
                }
            }
        })();
        self.detach();
        result
    }
}
