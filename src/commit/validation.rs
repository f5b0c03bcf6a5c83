//! Constraint and type validation.
//!
//! Everything here is pure: it looks at a request and a schema snapshot and never
//! touches the store. Checks that need the store's data (key collisions, parent rows,
//! CHECK expressions) are emitted as [`Probe`]s for the preflight stage to run.

use crate::catalog::schema::{
    CachedDatabaseSchema, ColumnSchema, TableSchema, literal_default,
};
use crate::catalog::types::{TypeFit, Value};
use crate::commit::tx::{
    ConstraintType, ConstraintViolation, EditOperation, EditRequest, RowData,
};
use crate::config::EngineConfig;
use crate::driver::quote_ident;
use crate::error::EngineError;
use crate::query::plan::{QuerySource, WhereClause};
use crate::query::planner::{
    IndexRecommendation, Optimization, OptimizationKind, suggest, table_query_shape,
    write_lookup_cost,
};
use crate::query::sql::{ReadShape, analyze_read, check_where_fragment, expression_columns};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::ops::Range;

/// Pseudo-columns every rowid table answers to.
const ROWID_NAMES: [&str; 3] = ["rowid", "oid", "_rowid_"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub constraint_violations: Vec<ConstraintViolation>,
    pub optimizations: Vec<Optimization>,
    pub recommended_indexes: Vec<IndexRecommendation>,
    pub estimated_cost: f64,
    pub schema_version: u64,
    /// A table or column the request names is missing from the snapshot.
    pub schema_mismatch: bool,
}

impl ValidationResult {
    fn new(schema_version: u64) -> Self {
        Self {
            valid: false,
            errors: Vec::new(),
            warnings: Vec::new(),
            constraint_violations: Vec::new(),
            optimizations: Vec::new(),
            recommended_indexes: Vec::new(),
            estimated_cost: 0.0,
            schema_version,
            schema_mismatch: false,
        }
    }

    fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty() && self.constraint_violations.is_empty();
        self
    }

    /// One-line summary of what blocked the request.
    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self.errors.clone();
        parts.extend(self.constraint_violations.iter().map(|v| v.message.clone()));
        parts.join("; ")
    }
}

/// What a store lookup must find for a probed constraint to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeExpectation {
    NoRows,
    SomeRow,
    /// The single returned value must not be false (NULL passes, as in SQL CHECK).
    NotFalse,
}

/// A read-only lookup that decides one constraint against the store's data.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub constraint_type: ConstraintType,
    pub table: String,
    pub column: Option<String>,
    pub sql: String,
    pub params: Vec<Value>,
    pub expect: ProbeExpectation,
    pub message: String,
    pub row_index: Option<usize>,
}

impl Probe {
    pub fn violation(&self) -> ConstraintViolation {
        let mut violation = ConstraintViolation::new(self.constraint_type, &self.table, &self.message)
            .row_index(self.row_index);
        violation.column = self.column.clone();
        violation
    }
}

fn inner_message(err: EngineError) -> String {
    match err {
        EngineError::Validation(message) => message,
        other => other.to_string(),
    }
}

fn source_label(table: &TableSchema, column: &ColumnSchema) -> Option<String> {
    let prop = column.source_property.as_ref()?;
    Some(match &table.source_entity {
        Some(entity) => format!("{}.{}: {}", entity.name, prop.name, prop.type_name),
        None => format!("{}: {}", prop.name, prop.type_name),
    })
}

fn lookup<'a>(data: &'a RowData, column: &str) -> Option<&'a Value> {
    data.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(column))
        .map(|(_, v)| v)
}

struct EditCheck<'a> {
    schema: &'a CachedDatabaseSchema,
    table: &'a TableSchema,
    config: &'a EngineConfig,
    result: ValidationResult,
    probes: Vec<Probe>,
}

impl<'a> EditCheck<'a> {
    fn error(&mut self, message: impl Into<String>) {
        self.result.errors.push(message.into());
    }

    fn violate(&mut self, violation: ConstraintViolation) {
        self.result.constraint_violations.push(violation);
    }

    /// Resolves a caller-supplied column name, recording a mismatch when it is unknown.
    fn resolve(&mut self, name: &str, row_index: Option<usize>) -> Option<&'a ColumnSchema> {
        if let Some(column) = self.table.column(name) {
            return Some(column);
        }
        let hint = self
            .table
            .columns
            .iter()
            .find(|c| {
                c.source_property
                    .as_ref()
                    .is_some_and(|p| p.name.eq_ignore_ascii_case(name))
            })
            .map(|c| format!(" (the source property {name} maps to column {})", c.name))
            .unwrap_or_default();
        let at = row_index.map(|i| format!("row {i}: ")).unwrap_or_default();
        self.error(format!(
            "{at}column '{name}' does not exist on table '{}'{hint}",
            self.table.name
        ));
        self.result.schema_mismatch = true;
        None
    }

    fn check_value(&mut self, column: &ColumnSchema, value: &Value, row_index: Option<usize>) {
        match value.fit(column.storage_type) {
            TypeFit::Rejected => {
                let mut violation = ConstraintViolation::new(
                    ConstraintType::DataType,
                    &self.table.name,
                    format!(
                        "column {} expects {} but got {}",
                        column.display_name(),
                        column.storage_type.as_str(),
                        value.type_name()
                    ),
                )
                .column(&column.name)
                .row_index(row_index);
                violation.expected = Some(column.storage_type.as_str().to_string());
                violation.actual = Some(value.type_name().to_string());
                violation.source_property = source_label(self.table, column);
                self.violate(violation);
            }
            TypeFit::Coerced => self.result.warnings.push(format!(
                "{} value for column {} is stored as {}",
                value.type_name(),
                column.name,
                column.storage_type.as_str()
            )),
            TypeFit::Exact | TypeFit::Widened => {}
        }
        if value.is_null() && !column.nullable && !column.is_auto_increment {
            let mut violation = ConstraintViolation::new(
                ConstraintType::NotNull,
                &self.table.name,
                format!("column {} cannot be NULL", column.display_name()),
            )
            .column(&column.name)
            .row_index(row_index);
            violation.source_property = source_label(self.table, column);
            self.violate(violation);
        }
    }

    /// Existence and type of every supplied column.
    fn check_values(&mut self, data: &RowData, row_index: Option<usize>) {
        for (name, value) in data {
            if let Some(column) = self.resolve(name, row_index) {
                self.check_value(column, value, row_index);
            }
        }
    }

    /// `earlier` holds the rows this request inserts before `data`.
    fn check_insert_row(&mut self, data: &RowData, row_index: Option<usize>, earlier: &[RowData]) {
        self.check_values(data, row_index);
        let table = self.table;
        let missing: Vec<&ColumnSchema> = table
            .columns
            .iter()
            .filter(|c| !c.may_be_omitted() && lookup(data, &c.name).is_none())
            .collect();
        for column in missing {
            let mut violation = ConstraintViolation::new(
                ConstraintType::NotNull,
                &self.table.name,
                format!("column {} is NOT NULL and has no default", column.display_name()),
            )
            .column(&column.name)
            .row_index(row_index);
            violation.source_property = source_label(self.table, column);
            self.violate(violation);
        }
        self.key_probes(data, row_index);
        self.foreign_key_probes(data, row_index, earlier);
        self.check_probes(data, row_index, true);
    }

    fn unique_keys(&self) -> Vec<(ConstraintType, Vec<String>)> {
        let mut keys = Vec::new();
        let pk: Vec<String> = self.table.primary_key.iter().cloned().collect();
        if !pk.is_empty() {
            keys.push((ConstraintType::PrimaryKey, pk));
        }
        for idx in self.schema.indexes_for(&self.table.name) {
            if !idx.unique || idx.is_partial() {
                continue;
            }
            let same_as_pk = idx.columns.len() == self.table.primary_key.len()
                && idx.columns.iter().all(|c| self.table.is_primary_key(c));
            if !same_as_pk {
                keys.push((ConstraintType::Unique, idx.columns.clone()));
            }
        }
        keys
    }

    /// Values for every column in `columns`, if all are supplied and non-null.
    fn key_values(data: &RowData, columns: &[String]) -> Option<Vec<Value>> {
        columns
            .iter()
            .map(|c| lookup(data, c).filter(|v| !v.is_null()).cloned())
            .collect()
    }

    fn existence_sql(table: &str, columns: &[String]) -> String {
        let predicate = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!("SELECT 1 FROM {} WHERE {predicate} LIMIT 1", quote_ident(table))
    }

    fn key_probes(&mut self, data: &RowData, row_index: Option<usize>) {
        for (kind, columns) in self.unique_keys() {
            let Some(values) = Self::key_values(data, &columns) else {
                continue;
            };
            let shown = columns
                .iter()
                .zip(&values)
                .map(|(c, v)| format!("{c}={}", display_value(v)))
                .collect::<Vec<_>>()
                .join(", ");
            let what = if kind == ConstraintType::PrimaryKey {
                "primary key"
            } else {
                "unique key"
            };
            self.probes.push(Probe {
                constraint_type: kind,
                table: self.table.name.clone(),
                column: columns.first().cloned(),
                sql: Self::existence_sql(&self.table.name, &columns),
                params: values,
                expect: ProbeExpectation::NoRows,
                message: format!("a row with {what} ({shown}) already exists in {}", self.table.name),
                row_index,
            });
        }
    }

    /// A parent supplied by the row itself or by an earlier row of the same request only
    /// exists once the write runs, so that reference is left to the store.
    fn foreign_key_probes(&mut self, data: &RowData, row_index: Option<usize>, earlier: &[RowData]) {
        if !self.config.foreign_key_probes {
            return;
        }
        for fk in &self.table.foreign_keys {
            let Some(values) = Self::key_values(data, &fk.from_columns) else {
                continue;
            };
            let Some(parent) = self.schema.table(&fk.to_table) else {
                self.result.warnings.push(format!(
                    "foreign key {} -> {} cannot be checked: parent table is unknown",
                    fk.from_columns.join(", "),
                    fk.to_table
                ));
                continue;
            };
            let parent_columns: Vec<String> = if !fk.to_columns.is_empty() {
                fk.to_columns.clone()
            } else if parent.primary_key.len() == 1 {
                parent.primary_key.iter().cloned().collect()
            } else {
                Vec::new()
            };
            if parent_columns.len() != values.len()
                || !self.schema.is_unique_key(&parent.name, &parent_columns)
            {
                self.result.warnings.push(format!(
                    "foreign key {} -> {} is not checked before the write: parent key is not indexed",
                    fk.from_columns.join(", "),
                    parent.name
                ));
                continue;
            }
            let written_here = parent.name.eq_ignore_ascii_case(&self.table.name)
                && std::iter::once(data)
                    .chain(earlier)
                    .any(|row| Self::key_values(row, &parent_columns).as_ref() == Some(&values));
            if written_here {
                self.result.warnings.push(format!(
                    "foreign key {} -> {} refers to a row written by the same request; the store checks it",
                    fk.from_columns.join(", "),
                    parent.name
                ));
                continue;
            }
            self.probes.push(Probe {
                constraint_type: ConstraintType::ForeignKey,
                table: self.table.name.clone(),
                column: fk.from_columns.first().cloned(),
                sql: Self::existence_sql(&parent.name, &parent_columns),
                params: values,
                expect: ProbeExpectation::SomeRow,
                message: format!(
                    "{} references a missing row in {}",
                    fk.from_columns.join(", "),
                    parent.name
                ),
                row_index,
            });
        }
    }

    /// CHECK constraints whose every column is known, evaluated over a one-row derived table.
    fn check_probes(&mut self, data: &RowData, row_index: Option<usize>, use_defaults: bool) {
        if !self.config.check_constraint_probes {
            return;
        }
        for check in &self.table.check_constraints {
            let columns = expression_columns(&check.expression);
            if columns.is_empty() {
                continue;
            }
            let mut values = Vec::with_capacity(columns.len());
            for name in &columns {
                let value = lookup(data, name).cloned().or_else(|| {
                    use_defaults
                        .then(|| self.table.column(name))
                        .flatten()
                        .and_then(|c| match &c.default_value {
                            Some(raw) => literal_default(raw),
                            None if c.nullable => Some(Value::Null),
                            None => None,
                        })
                });
                match value {
                    Some(value) => values.push(value),
                    None => break,
                }
            }
            if values.len() != columns.len() {
                continue;
            }
            let aliases = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("?{} AS {}", i + 1, quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let label = check
                .name
                .as_deref()
                .map(|n| format!("CHECK constraint {n}"))
                .unwrap_or_else(|| format!("CHECK ({})", check.expression));
            self.probes.push(Probe {
                constraint_type: ConstraintType::Check,
                table: self.table.name.clone(),
                column: columns.first().cloned(),
                sql: format!("SELECT ({}) FROM (SELECT {aliases})", check.expression),
                params: values,
                expect: ProbeExpectation::NotFalse,
                message: format!("{label} on {} would fail", self.table.name),
                row_index,
            });
        }
    }

    /// Duplicate primary/unique keys inside one batch.
    fn batch_duplicates(&mut self, rows: &[RowData], base: usize) {
        for (kind, columns) in self.unique_keys() {
            let mut seen = BTreeSet::new();
            for (offset, data) in rows.iter().enumerate() {
                let Some(values) = Self::key_values(data, &columns) else {
                    continue;
                };
                if !seen.insert(values) {
                    self.violate(
                        ConstraintViolation::new(
                            kind,
                            &self.table.name,
                            format!(
                                "batch repeats the key ({}) of an earlier row",
                                columns.join(", ")
                            ),
                        )
                        .column(&columns[0])
                        .row_index(Some(base + offset)),
                    );
                }
            }
        }
    }

    fn check_filter(&mut self, filter: &WhereClause) -> Vec<String> {
        match filter {
            WhereClause::Raw { sql, args } => match check_where_fragment(sql, args.len()) {
                Ok(columns) => {
                    // The scanner is approximate, so unknown names only warn.
                    for column in &columns {
                        if !self.table.has_column(column) && !is_rowid_name(column) {
                            self.result.warnings.push(format!(
                                "where clause mentions '{column}', which is not a column of {}",
                                self.table.name
                            ));
                        }
                    }
                    columns
                }
                Err(err) => {
                    self.error(inner_message(err));
                    Vec::new()
                }
            },
            WhereClause::Expr(expr) => {
                if let Err(err) = expr.validate_depth() {
                    self.error(inner_message(err));
                }
                let columns: Vec<String> = expr.columns().into_iter().map(str::to_string).collect();
                for column in &columns {
                    if !is_rowid_name(column) {
                        self.resolve(column, None);
                    }
                }
                columns
            }
        }
    }

    fn key_columns(&mut self) -> Option<Vec<String>> {
        if self.table.primary_key.is_empty() {
            self.error(format!(
                "table {} has no primary key; keyed batch edits need one",
                self.table.name
            ));
            return None;
        }
        Some(self.table.primary_key.iter().cloned().collect())
    }

    fn cost_for_filter(&mut self, filter_columns: &[String]) {
        let (cost, rec) = write_lookup_cost(self.schema, self.table, filter_columns);
        self.result.estimated_cost += cost;
        if let Some(rec) = rec {
            self.result.optimizations.push(Optimization {
                kind: OptimizationKind::IndexUsage,
                table: Some(self.table.name.clone()),
                columns: rec.columns.clone(),
                message: format!(
                    "the where clause on {} has no index and scans the table",
                    self.table.name
                ),
            });
            if !self.result.recommended_indexes.contains(&rec) {
                self.result.recommended_indexes.push(rec);
            }
        }
    }
}

fn is_rowid_name(name: &str) -> bool {
    ROWID_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => v.to_string(),
        Value::Text(v) => format!("'{v}'"),
        Value::Blob(v) => format!("<{} bytes>", v.len()),
        Value::Boolean(v) => v.to_string(),
    }
}

/// Validates an edit against a snapshot and plans the probes it needs.
///
/// `chunk` selects the batch rows this call covers; it is ignored for single-row edits.
pub fn validate_edit(
    request: &EditRequest,
    schema: &CachedDatabaseSchema,
    config: &EngineConfig,
    chunk: Range<usize>,
) -> (ValidationResult, Vec<Probe>) {
    let mut result = ValidationResult::new(schema.schema_version);
    let Some(table) = schema.table(&request.table_name) else {
        if schema.view(&request.table_name).is_some() {
            result
                .errors
                .push(format!("{} is a view and cannot be edited", request.table_name));
        } else {
            result
                .errors
                .push(format!("table '{}' not found", request.table_name));
            result.schema_mismatch = true;
        }
        return (result.finish(), Vec::new());
    };
    let mut check = EditCheck {
        schema,
        table,
        config,
        result,
        probes: Vec::new(),
    };

    let op = request.operation;
    if op.is_batch() {
        if request.rows.is_empty() {
            check.error(format!("{} needs at least one row", op.as_str()));
        }
        if request.filter.is_some() {
            check.error(format!("{} does not take a where clause", op.as_str()));
        }
        if !request.data.is_empty() {
            check.error(format!("{} takes its values from rows, not data", op.as_str()));
        }
    } else if !request.rows.is_empty() {
        check.error(format!("{} takes data, not rows", op.as_str()));
    }
    let end = chunk.end.min(request.rows.len());
    let start = chunk.start.min(end);
    let batch = &request.rows[start..end];

    match op {
        EditOperation::Insert => {
            if request.filter.is_some() {
                check.error("insert does not take a where clause");
            }
            check.check_insert_row(&request.data, None, &[]);
            check.result.estimated_cost += 1.0;
        }
        EditOperation::BatchInsert => {
            for (offset, data) in batch.iter().enumerate() {
                check.check_insert_row(data, Some(start + offset), &batch[..offset]);
            }
            check.batch_duplicates(batch, start);
            check.result.estimated_cost += batch.len() as f64;
        }
        EditOperation::Update | EditOperation::Delete => {
            if op == EditOperation::Update {
                if request.data.is_empty() {
                    check.error("update needs at least one column to set");
                }
                check.check_values(&request.data, None);
                check.foreign_key_probes(&request.data, None, &[]);
                check.check_probes(&request.data, None, false);
            } else if !request.data.is_empty() {
                check
                    .result
                    .warnings
                    .push("delete ignores the data map".to_string());
            }
            match &request.filter {
                Some(filter) => {
                    let columns = check.check_filter(filter);
                    check.cost_for_filter(&columns);
                }
                None if request.config.affect_all_rows => {
                    check.result.warnings.push(format!(
                        "{} applies to every row of {}",
                        op.as_str(),
                        table.name
                    ));
                    check.cost_for_filter(&[]);
                }
                None => check.violate(ConstraintViolation::new(
                    ConstraintType::UnscopedMutation,
                    &table.name,
                    format!(
                        "{} on {} has no where clause; set affect_all_rows to touch every row",
                        op.as_str(),
                        table.name
                    ),
                )),
            }
        }
        EditOperation::BatchUpdate | EditOperation::BatchDelete => {
            if let Some(keys) = check.key_columns() {
                for (offset, data) in batch.iter().enumerate() {
                    let index = start + offset;
                    for key in &keys {
                        if lookup(data, key).is_none_or(Value::is_null) {
                            check.error(format!("row {index}: key column {key} is missing"));
                        }
                    }
                    let (key_part, rest): (RowData, RowData) = data
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .partition(|(k, _)| table.is_primary_key(k));
                    check.check_values(&key_part, Some(index));
                    if op == EditOperation::BatchUpdate {
                        if rest.is_empty() {
                            check.error(format!("row {index}: nothing to update besides the key"));
                        }
                        check.check_values(&rest, Some(index));
                        check.foreign_key_probes(&rest, Some(index), &[]);
                    } else if !rest.is_empty() {
                        check.result.warnings.push(format!(
                            "row {index}: non-key columns are ignored by batch delete"
                        ));
                    }
                }
                check.cost_for_filter(&keys);
                check.result.estimated_cost *= batch.len().max(1) as f64;
            }
        }
    }

    let EditCheck { result, probes, .. } = check;
    (result.finish(), probes)
}

/// Validates a read and returns its shape for the planner.
///
/// Unknown columns only warn: the read may still run against an evolving schema.
pub fn validate_read(
    source: &QuerySource,
    schema: &CachedDatabaseSchema,
    config: &EngineConfig,
) -> (ValidationResult, Option<ReadShape>) {
    let mut result = ValidationResult::new(schema.schema_version);
    let shape = match source {
        QuerySource::Sql { sql, params } => match analyze_read(sql) {
            Ok(shape) => {
                if shape.placeholder_count != params.len() {
                    result.errors.push(format!(
                        "query has {} placeholders but {} parameters were supplied",
                        shape.placeholder_count,
                        params.len()
                    ));
                }
                shape
            }
            Err(err) => {
                result.errors.push(inner_message(err));
                return (result.finish(), None);
            }
        },
        QuerySource::Table(query) => {
            match &query.filter {
                Some(WhereClause::Raw { sql, args }) => {
                    if let Err(err) = check_where_fragment(sql, args.len()) {
                        result.errors.push(inner_message(err));
                    }
                }
                Some(WhereClause::Expr(expr)) => {
                    if let Err(err) = expr.validate_depth() {
                        result.errors.push(inner_message(err));
                    }
                }
                None => {}
            }
            if query.table.is_empty() {
                result.errors.push("table query names no table".to_string());
                return (result.finish(), None);
            }
            table_query_shape(query)
        }
    };

    let mut known_tables: Vec<&TableSchema> = Vec::new();
    for name in &shape.tables {
        if shape.cte_names.iter().any(|c| c.eq_ignore_ascii_case(name))
            || name.to_ascii_lowercase().starts_with("sqlite_")
            || schema.view(name).is_some()
        {
            continue;
        }
        match schema.table(name) {
            Some(table) => known_tables.push(table),
            None => {
                result.errors.push(format!("table '{name}' not found"));
                result.schema_mismatch = true;
            }
        }
    }

    // Only judge column names when every source of columns is a known table.
    if !known_tables.is_empty() && known_tables.len() == shape.tables.len() {
        let mut referenced: Vec<&String> = shape.filter_columns.iter().collect();
        if let crate::query::sql::Projection::Columns(columns) = &shape.projection {
            referenced.extend(columns);
        }
        referenced.extend(shape.order_by.iter().map(|(c, _)| c));
        let mut warned = HashSet::new();
        for column in referenced {
            let exists = is_rowid_name(column) || known_tables.iter().any(|t| t.has_column(column));
            if !exists && warned.insert(column.to_ascii_lowercase()) {
                result.warnings.push(format!(
                    "column '{column}' is not in {}",
                    shape.tables.join(", ")
                ));
            }
        }
    }

    let advice = suggest(&shape, schema, config);
    result.optimizations = advice.optimizations;
    result.recommended_indexes = advice.recommended_indexes;
    result.estimated_cost = advice.estimated_cost;
    (result.finish(), Some(shape))
}
