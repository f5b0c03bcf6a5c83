//! Renders validated edits into parameterized SQL.

use crate::catalog::schema::TableSchema;
use crate::catalog::types::Value;
use crate::commit::tx::{EditOperation, EditRequest, RowData};
use crate::driver::quote_ident;
use crate::error::EngineError;
use crate::query::plan::WhereClause;

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Column name as the store spells it.
fn canonical<'a>(table: &'a TableSchema, name: &'a str) -> &'a str {
    table.column(name).map(|c| c.name.as_str()).unwrap_or(name)
}

fn bind(params: &mut Vec<Value>, value: &Value) -> String {
    params.push(value.clone());
    format!("?{}", params.len())
}

fn filter_sql(filter: Option<&WhereClause>, params: &mut Vec<Value>) -> String {
    match filter {
        Some(clause) => {
            let (sql, args) = clause.render(params.len());
            params.extend(args);
            format!(" WHERE {sql}")
        }
        None => String::new(),
    }
}

pub fn insert(table: &TableSchema, data: &RowData) -> Statement {
    if data.is_empty() {
        return Statement {
            sql: format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&table.name)),
            params: Vec::new(),
        };
    }
    let mut params = Vec::with_capacity(data.len());
    let columns: Vec<String> = data
        .keys()
        .map(|k| quote_ident(canonical(table, k)))
        .collect();
    let placeholders: Vec<String> = data.values().map(|v| bind(&mut params, v)).collect();
    Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&table.name),
            columns.join(", "),
            placeholders.join(", ")
        ),
        params,
    }
}

fn set_list<'a>(
    table: &TableSchema,
    pairs: impl Iterator<Item = (&'a String, &'a Value)>,
    params: &mut Vec<Value>,
) -> String {
    pairs
        .map(|(k, v)| format!("{} = {}", quote_ident(canonical(table, k)), bind(params, v)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn update(table: &TableSchema, data: &RowData, filter: Option<&WhereClause>) -> Statement {
    let mut params = Vec::new();
    let set = set_list(table, data.iter(), &mut params);
    let filter = filter_sql(filter, &mut params);
    Statement {
        sql: format!("UPDATE {} SET {set}{filter}", quote_ident(&table.name)),
        params,
    }
}

pub fn delete(table: &TableSchema, filter: Option<&WhereClause>) -> Statement {
    let mut params = Vec::new();
    let filter = filter_sql(filter, &mut params);
    Statement {
        sql: format!("DELETE FROM {}{filter}", quote_ident(&table.name)),
        params,
    }
}

fn key_predicate(table: &TableSchema, data: &RowData, params: &mut Vec<Value>) -> Result<String, EngineError> {
    table
        .primary_key
        .iter()
        .map(|key| {
            let value = data
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
                .ok_or_else(|| EngineError::Validation(format!("row is missing key column {key}")))?;
            Ok(format!("{} = {}", quote_ident(key), bind(params, value)))
        })
        .collect::<Result<Vec<_>, EngineError>>()
        .map(|parts| parts.join(" AND "))
}

/// `UPDATE ... WHERE <pk> = ...` for one batch row.
pub fn keyed_update(table: &TableSchema, data: &RowData) -> Result<Statement, EngineError> {
    let mut params = Vec::new();
    let set = set_list(
        table,
        data.iter().filter(|(k, _)| !table.is_primary_key(k)),
        &mut params,
    );
    let predicate = key_predicate(table, data, &mut params)?;
    Ok(Statement {
        sql: format!("UPDATE {} SET {set} WHERE {predicate}", quote_ident(&table.name)),
        params,
    })
}

pub fn keyed_delete(table: &TableSchema, data: &RowData) -> Result<Statement, EngineError> {
    let mut params = Vec::new();
    let predicate = key_predicate(table, data, &mut params)?;
    Ok(Statement {
        sql: format!("DELETE FROM {} WHERE {predicate}", quote_ident(&table.name)),
        params,
    })
}

/// Statements for the rows of `request` inside `chunk` (single edits ignore it).
pub fn statements(
    request: &EditRequest,
    table: &TableSchema,
    chunk: std::ops::Range<usize>,
) -> Result<Vec<Statement>, EngineError> {
    let end = chunk.end.min(request.rows.len());
    let rows = &request.rows[chunk.start.min(end)..end];
    match request.operation {
        EditOperation::Insert => Ok(vec![insert(table, &request.data)]),
        EditOperation::Update => Ok(vec![update(table, &request.data, request.filter.as_ref())]),
        EditOperation::Delete => Ok(vec![delete(table, request.filter.as_ref())]),
        EditOperation::BatchInsert => Ok(rows.iter().map(|r| insert(table, r)).collect()),
        EditOperation::BatchUpdate => rows.iter().map(|r| keyed_update(table, r)).collect(),
        EditOperation::BatchDelete => rows.iter().map(|r| keyed_delete(table, r)).collect(),
    }
}

/// Counts the rows a dry-run update or delete would touch.
pub fn count_matching(table: &TableSchema, filter: Option<&WhereClause>) -> Statement {
    let mut params = Vec::new();
    let filter = filter_sql(filter, &mut params);
    Statement {
        sql: format!("SELECT COUNT(*) FROM {}{filter}", quote_ident(&table.name)),
        params,
    }
}

/// Counts which batch rows (by key) exist, for dry-run keyed edits.
pub fn count_keyed(table: &TableSchema, data: &RowData) -> Result<Statement, EngineError> {
    let mut params = Vec::new();
    let predicate = key_predicate(table, data, &mut params)?;
    Ok(Statement {
        sql: format!("SELECT COUNT(*) FROM {} WHERE {predicate}", quote_ident(&table.name)),
        params,
    })
}
