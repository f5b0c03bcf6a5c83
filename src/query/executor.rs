use crate::catalog::schema::CachedDatabaseSchema;
use crate::catalog::types::Value;
use crate::config::EngineConfig;
use crate::driver::{RowSet, quote_ident};
use crate::error::EngineError;
use crate::query::plan::{
    ColumnMetadata, Order, PageRequest, QueryResult, QuerySource, TableQuery,
};
use crate::query::planner::{PaginationStrategy, QueryAdvice, choose_strategy};
use crate::query::sql::{Projection, ReadShape, StatementKind, TokenKind, tokenize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
enum PagePosition {
    Offset(u64),
    After {
        key_column: String,
        order: Order,
        value: Value,
    },
}

/// Opaque continuation for a paged read. Stateless: everything needed to resume lives here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PageToken {
    fingerprint: String,
    position: PagePosition,
    /// Rows handed out by earlier pages.
    served: u64,
}

fn encode_page_token(token: &PageToken) -> Result<String, EngineError> {
    let bytes = rmp_serde::to_vec(token).map_err(|e| EngineError::Encode(e.to_string()))?;
    Ok(hex::encode(bytes))
}

fn decode_page_token(encoded: &str) -> Result<PageToken, EngineError> {
    let bytes = hex::decode(encoded)
        .map_err(|_| EngineError::InvalidPageToken("token is not valid hex".into()))?;
    rmp_serde::from_slice(&bytes).map_err(|e| EngineError::InvalidPageToken(e.to_string()))
}

/// Identifies the query a token was issued for.
fn fingerprint(source: &QuerySource) -> Result<String, EngineError> {
    let bytes = rmp_serde::to_vec(source).map_err(|e| EngineError::Encode(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// A read rewritten for one page, ready for the driver.
#[derive(Debug, Clone)]
pub struct PreparedRead {
    pub sql: String,
    pub params: Vec<Value>,
    pub page_size: usize,
    pub strategy: PaginationStrategy,
    pub warnings: Vec<String>,
    shape: ReadShape,
    fingerprint: String,
    served: u64,
    offset: u64,
    /// Rows this page may still return under the query's own LIMIT.
    remaining: Option<u64>,
    paged: bool,
}

impl PreparedRead {
    fn fetch_limit(&self) -> usize {
        self.page_size + 1
    }
}

/// Planner output plus the SQL a read would run, without running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExplanation {
    pub rewritten_sql: String,
    pub param_count: usize,
    pub page_size: usize,
    pub strategy: PaginationStrategy,
    pub advice: QueryAdvice,
    pub warnings: Vec<String>,
}

fn page_size(page: &PageRequest, config: &EngineConfig) -> Result<usize, EngineError> {
    match page.page_size {
        Some(0) => Err(EngineError::Validation("page_size must be > 0".into())),
        Some(n) => Ok(n.min(config.max_result_rows)),
        None => Ok(config.default_page_size.min(config.max_result_rows)),
    }
}

/// Statement text without trailing separators or comments.
fn statement_body(sql: &str) -> Result<&str, EngineError> {
    let scanned = tokenize(sql)?;
    let end = scanned
        .tokens
        .iter()
        .rev()
        .find(|t| t.kind != TokenKind::Semicolon)
        .map(|t| t.end)
        .unwrap_or(0);
    Ok(sql[..end].trim_start())
}

/// Rewrites a validated read into one page of SQL.
pub fn prepare_read(
    source: &QuerySource,
    page: &PageRequest,
    shape: ReadShape,
    schema: &CachedDatabaseSchema,
    config: &EngineConfig,
) -> Result<PreparedRead, EngineError> {
    let page_size = page_size(page, config)?;
    let fingerprint = fingerprint(source)?;
    let token = page
        .page_token
        .as_deref()
        .map(decode_page_token)
        .transpose()?;
    if let Some(token) = &token {
        if token.fingerprint != fingerprint {
            return Err(EngineError::InvalidPageToken(
                "token was issued for a different query".into(),
            ));
        }
    }

    // A token pins the strategy it was issued under, so growing tables do not flip it mid-scan.
    let (strategy, offset, after, served) = match token {
        Some(PageToken {
            position: PagePosition::Offset(offset),
            served,
            ..
        }) => (PaginationStrategy::Offset, offset, None, served),
        Some(PageToken {
            position:
                PagePosition::After {
                    key_column,
                    order,
                    value,
                },
            served,
            ..
        }) => {
            let known = shape
                .tables
                .first()
                .and_then(|t| schema.table(t))
                .is_some_and(|t| t.has_column(&key_column));
            if !known {
                return Err(EngineError::InvalidPageToken(format!(
                    "cursor column {key_column} no longer exists"
                )));
            }
            (
                PaginationStrategy::Cursor { key_column, order },
                0,
                Some(value),
                served,
            )
        }
        None => (choose_strategy(&shape, schema, config), 0, None, 0),
    };

    let mut warnings = Vec::new();
    if offset > config.deep_offset_warning_rows {
        warn!(offset, "deep offset page");
        warnings.push(format!(
            "page starts {offset} rows in; offset paging slows down linearly with depth"
        ));
    }

    let mut prepared = PreparedRead {
        sql: String::new(),
        params: Vec::new(),
        page_size,
        strategy,
        warnings,
        shape,
        fingerprint,
        served,
        offset,
        remaining: None,
        paged: true,
    };
    match source {
        QuerySource::Sql { sql, params } => {
            prepare_sql(&mut prepared, sql, params, after, schema)?;
        }
        QuerySource::Table(query) => prepare_table(&mut prepared, query, after, schema),
    }
    Ok(prepared)
}

fn prepare_sql(
    prepared: &mut PreparedRead,
    sql: &str,
    params: &[Value],
    after: Option<Value>,
    schema: &CachedDatabaseSchema,
) -> Result<(), EngineError> {
    let base = statement_body(sql)?;
    prepared.params = params.to_vec();
    let shape = &prepared.shape;
    let next = shape.placeholder_count.max(params.len());

    if shape.kind == StatementKind::Explain {
        prepared.sql = base.to_string();
        prepared.paged = false;
        return Ok(());
    }

    match prepared.strategy.clone() {
        PaginationStrategy::Cursor { key_column, order } => {
            let key = quote_ident(&key_column);
            let mut sql = format!("SELECT * FROM (\n{base}\n) AS storebridge_page");
            if let Some(value) = after {
                prepared.params.push(value);
                let op = if order == Order::Desc { "<" } else { ">" };
                sql.push_str(&format!(" WHERE {key} {op} ?{}", next + 1));
            }
            let fetch = prepared.fetch_limit() as i64;
            prepared.params.push(Value::Integer(fetch));
            sql.push_str(&format!(
                " ORDER BY {key} {} LIMIT ?{}",
                order.as_sql(),
                prepared.params.len()
            ));
            prepared.sql = sql;
        }
        PaginationStrategy::Offset => {
            let appendable = matches!(shape.kind, StatementKind::Select | StatementKind::With)
                && !shape.has_limit
                && !shape.has_offset
                && !shape.is_compound;
            let mut sql = if appendable {
                let mut sql = base.to_string();
                let deterministic = shape.is_simple()
                    && shape.order_by.is_empty()
                    && !shape.order_by_expressions
                    && !shape.is_distinct
                    && matches!(shape.projection, Projection::Star | Projection::Columns(_))
                    && schema.table(&shape.tables[0]).is_some_and(|t| t.has_rowid);
                if deterministic {
                    sql.push_str("\nORDER BY rowid");
                }
                sql
            } else {
                format!("SELECT * FROM (\n{base}\n) AS storebridge_page")
            };
            let fetch = prepared.fetch_limit() as i64;
            prepared.params.push(Value::Integer(fetch));
            prepared.params.push(Value::Integer(prepared.offset as i64));
            sql.push_str(&format!(
                "\nLIMIT ?{} OFFSET ?{}",
                next + 1,
                next + 2
            ));
            prepared.sql = sql;
        }
    }
    Ok(())
}

fn prepare_table(
    prepared: &mut PreparedRead,
    query: &TableQuery,
    after: Option<Value>,
    schema: &CachedDatabaseSchema,
) {
    let table = schema.table(&query.table);
    let projection = if query.select.is_empty() {
        "*".to_string()
    } else {
        query
            .select
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut sql = format!("SELECT {projection} FROM {}", quote_ident(&query.table));
    let mut conditions = Vec::new();
    if let Some(filter) = &query.filter {
        let (clause, args) = filter.render(prepared.params.len());
        conditions.push(clause);
        prepared.params.extend(args);
    }

    let order_by = match (&prepared.strategy, after) {
        (PaginationStrategy::Cursor { key_column, order }, after) => {
            let key = quote_ident(key_column);
            if let Some(value) = after {
                prepared.params.push(value);
                let op = if *order == Order::Desc { "<" } else { ">" };
                conditions.push(format!("{key} {op} ?{}", prepared.params.len()));
            }
            format!("{key} {}", order.as_sql())
        }
        (PaginationStrategy::Offset, _) => {
            let mut terms: Vec<String> = query
                .order_by
                .iter()
                .map(|(c, o)| format!("{} {}", quote_ident(c), o.as_sql()))
                .collect();
            // Ties need a total order or pages may overlap.
            match table {
                Some(t) if t.has_rowid => terms.push("rowid".to_string()),
                Some(t) => terms.extend(t.primary_key.iter().map(|c| quote_ident(c))),
                None => {}
            }
            terms.join(", ")
        }
    };
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    if !order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_by);
    }

    if let Some(limit) = query.limit {
        let remaining = (limit as u64).saturating_sub(prepared.served);
        prepared.remaining = Some(remaining);
        prepared.page_size = prepared.page_size.min(remaining as usize);
    }
    let fetch = prepared.fetch_limit() as i64;
    prepared.params.push(Value::Integer(fetch));
    sql.push_str(&format!(" LIMIT ?{}", prepared.params.len()));
    if prepared.strategy == PaginationStrategy::Offset {
        prepared.params.push(Value::Integer(prepared.offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", prepared.params.len()));
    }
    prepared.sql = sql;
}

/// Turns a fetched page into the caller-facing result and the token for the next page.
pub fn finish_read(
    prepared: PreparedRead,
    rowset: RowSet,
    schema: &CachedDatabaseSchema,
    advice_warnings: Vec<String>,
) -> Result<QueryResult, EngineError> {
    let mut warnings = advice_warnings;
    warnings.extend(prepared.warnings.iter().cloned());
    let metadata = column_metadata(&rowset, &prepared.shape, schema);
    let mut rows = rowset.rows;

    if !prepared.paged {
        if rows.len() > prepared.page_size {
            rows.truncate(prepared.page_size);
            warnings.push(format!("output truncated to {} rows", prepared.page_size));
        }
        return Ok(QueryResult {
            rows,
            column_metadata: metadata,
            has_more: false,
            next_page_token: None,
            warnings,
            schema_version: schema.schema_version,
        });
    }

    let page = prepared.page_size;
    let more_allowed = prepared.remaining.is_none_or(|r| r > page as u64);
    let has_more = rows.len() > page && more_allowed;
    rows.truncate(page);

    let next_page_token = if has_more {
        let position = match &prepared.strategy {
            PaginationStrategy::Offset => PagePosition::Offset(prepared.offset + page as u64),
            PaginationStrategy::Cursor { key_column, order } => {
                let index = metadata
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(key_column))
                    .ok_or_else(|| {
                        EngineError::execution(format!(
                            "cursor column {key_column} missing from the result"
                        ))
                    })?;
                let value = rows
                    .last()
                    .and_then(|row| row.get(index))
                    .cloned()
                    .unwrap_or(Value::Null);
                PagePosition::After {
                    key_column: key_column.clone(),
                    order: *order,
                    value,
                }
            }
        };
        Some(encode_page_token(&PageToken {
            fingerprint: prepared.fingerprint.clone(),
            position,
            served: prepared.served + rows.len() as u64,
        })?)
    } else {
        None
    };

    Ok(QueryResult {
        rows,
        column_metadata: metadata,
        has_more,
        next_page_token,
        warnings,
        schema_version: schema.schema_version,
    })
}

fn column_metadata(
    rowset: &RowSet,
    shape: &ReadShape,
    schema: &CachedDatabaseSchema,
) -> Vec<ColumnMetadata> {
    let table = match shape.tables.as_slice() {
        [only] => schema.table(only),
        _ => None,
    };
    rowset
        .columns
        .iter()
        .map(|result| {
            let cached = table.and_then(|t| t.column(&result.name));
            ColumnMetadata {
                name: result.name.clone(),
                declared_type: result
                    .declared_type
                    .clone()
                    .or_else(|| cached.map(|c| c.declared_type.clone())),
                storage_type: cached.map(|c| c.storage_type),
                nullable: cached.map(|c| c.nullable),
                source_property: cached.and_then(|c| c.source_property.clone()),
            }
        })
        .collect()
}

pub fn explain(prepared: &PreparedRead, advice: QueryAdvice) -> QueryExplanation {
    QueryExplanation {
        rewritten_sql: prepared.sql.clone(),
        param_count: prepared.params.len(),
        page_size: prepared.page_size,
        strategy: prepared.strategy.clone(),
        advice,
        warnings: prepared.warnings.clone(),
    }
}
