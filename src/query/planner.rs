use crate::catalog::schema::{CachedDatabaseSchema, TableSchema};
use crate::config::EngineConfig;
use crate::driver::quote_ident;
use crate::query::plan::{Order, TableQuery, WhereClause};
use crate::query::sql::{Projection, ReadShape, StatementKind, expression_columns};
use serde::{Deserialize, Serialize};

/// Row estimate used when the catalog has no statistics for a table.
const DEFAULT_ROW_ESTIMATE: u64 = 1_000;
/// Name reported when a lookup goes through the rowid b-tree.
const ROWID_LOOKUP: &str = "rowid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationKind {
    IndexUsage,
    Pagination,
    ProjectionNarrowing,
    LeadingWildcardLike,
    MissingLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Optimization {
    pub kind: OptimizationKind,
    pub table: Option<String>,
    pub columns: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecommendation {
    pub table: String,
    pub columns: Vec<String>,
    pub create_sql: String,
}

impl IndexRecommendation {
    fn single(table: &str, column: &str) -> Self {
        let name = format!("idx_{}_{}", sanitize(table), sanitize(column));
        Self {
            table: table.to_string(),
            columns: vec![column.to_string()],
            create_sql: format!(
                "CREATE INDEX {} ON {} ({})",
                quote_ident(&name),
                quote_ident(table),
                quote_ident(column)
            ),
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// How a read is split into pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaginationStrategy {
    Offset,
    /// Resume after the last seen value of a unique, indexed key.
    Cursor { key_column: String, order: Order },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAdvice {
    pub optimizations: Vec<Optimization>,
    pub recommended_indexes: Vec<IndexRecommendation>,
    pub estimated_rows: u64,
    pub estimated_cost: f64,
    pub index_used: Option<String>,
    pub strategy: PaginationStrategy,
}

/// Shape facts for a structured table query, in the same form the scanner produces for SQL.
pub fn table_query_shape(query: &TableQuery) -> ReadShape {
    let filter_columns = match &query.filter {
        Some(WhereClause::Expr(expr)) => expr.columns().into_iter().map(str::to_string).collect(),
        Some(WhereClause::Raw { sql, .. }) => expression_columns(sql),
        None => Vec::new(),
    };
    let leading_wildcard_likes = match &query.filter {
        Some(WhereClause::Expr(expr)) => expr.leading_wildcard_likes(),
        _ => Vec::new(),
    };
    ReadShape {
        kind: StatementKind::Select,
        tables: vec![query.table.clone()],
        projection: if query.select.is_empty() {
            Projection::Star
        } else {
            Projection::Columns(query.select.clone())
        },
        filter_columns,
        order_by: query.order_by.clone(),
        order_by_expressions: false,
        has_limit: query.limit.is_some(),
        has_offset: false,
        has_group_by: false,
        is_distinct: false,
        has_join: false,
        is_compound: false,
        leading_wildcard_likes,
        placeholder_count: 0,
        cte_names: Vec::new(),
    }
}

fn row_estimate(table: &TableSchema) -> u64 {
    table.estimated_row_count.unwrap_or(DEFAULT_ROW_ESTIMATE)
}

/// First index (or the rowid) whose leading column is one of `columns`.
///
/// Returns the index name and the expected number of rows per key.
fn usable_index(
    schema: &CachedDatabaseSchema,
    table: &TableSchema,
    columns: &[String],
) -> Option<(String, u64)> {
    let mentioned = |name: &str| columns.iter().any(|c| c.eq_ignore_ascii_case(name));
    if let Some(alias) = table.rowid_alias() {
        if mentioned(alias.name.as_str()) {
            return Some((ROWID_LOOKUP.to_string(), 1));
        }
    }
    if table.has_rowid && mentioned(ROWID_LOOKUP) {
        return Some((ROWID_LOOKUP.to_string(), 1));
    }
    let rows = row_estimate(table);
    schema
        .indexes_for(&table.name)
        .filter(|idx| !idx.is_partial())
        .filter(|idx| idx.leading_column().is_some_and(|lead| mentioned(lead)))
        .map(|idx| {
            let per_key = if idx.unique && idx.columns.len() == 1 {
                1
            } else {
                match idx.cardinality {
                    Some(distinct) if distinct > 0 => (rows / distinct).max(1),
                    _ => (rows / 10).max(1),
                }
            };
            (idx.name.clone(), per_key)
        })
        .min_by_key(|(_, per_key)| *per_key)
}

/// True if rows come back already ordered by `column` through an index or the rowid.
fn sort_is_indexed(schema: &CachedDatabaseSchema, table: &TableSchema, column: &str) -> bool {
    if table
        .rowid_alias()
        .is_some_and(|alias| alias.name.eq_ignore_ascii_case(column))
    {
        return true;
    }
    schema.indexes_for(&table.name).any(|idx| {
        !idx.is_partial()
            && idx
                .leading_column()
                .is_some_and(|lead| lead.eq_ignore_ascii_case(column))
    })
}

/// A unique, non-null, indexed key that orders rows totally.
pub fn cursor_key(schema: &CachedDatabaseSchema, table: &TableSchema) -> Option<String> {
    if let Some(alias) = table.rowid_alias() {
        return Some(alias.name.clone());
    }
    schema
        .indexes_for(&table.name)
        .filter(|idx| idx.unique && !idx.is_partial() && idx.columns.len() == 1)
        .filter_map(|idx| table.column(&idx.columns[0]))
        .find(|column| !column.nullable)
        .map(|column| column.name.clone())
}

fn projection_contains(projection: &Projection, column: &str) -> bool {
    match projection {
        Projection::Star => true,
        Projection::Columns(cols) => cols.iter().any(|c| c.eq_ignore_ascii_case(column)),
        Projection::Expressions => false,
    }
}

/// Picks a pagination strategy for a single-table read.
///
/// Cursor paging needs a unique monotonic key that the caller either sorts by or does not
/// sort at all, and only pays off once the table is larger than the configured threshold.
pub fn choose_strategy(
    shape: &ReadShape,
    schema: &CachedDatabaseSchema,
    config: &EngineConfig,
) -> PaginationStrategy {
    if !shape.is_simple() || shape.has_limit || shape.has_offset || shape.order_by_expressions {
        return PaginationStrategy::Offset;
    }
    let Some(table) = schema.table(&shape.tables[0]) else {
        return PaginationStrategy::Offset;
    };
    if row_estimate(table) <= config.cursor_pagination_threshold {
        return PaginationStrategy::Offset;
    }
    let Some(key) = cursor_key(schema, table) else {
        return PaginationStrategy::Offset;
    };
    if !projection_contains(&shape.projection, &key) {
        return PaginationStrategy::Offset;
    }
    match shape.order_by.as_slice() {
        [] => PaginationStrategy::Cursor {
            key_column: key,
            order: Order::Asc,
        },
        [(column, order)] if column.eq_ignore_ascii_case(&key) => PaginationStrategy::Cursor {
            key_column: key,
            order: *order,
        },
        _ => PaginationStrategy::Offset,
    }
}

/// Index, projection, LIKE and pagination advice for a read, plus a cost estimate.
///
/// Advice is never an error; unknown tables are simply skipped.
pub fn suggest(
    shape: &ReadShape,
    schema: &CachedDatabaseSchema,
    config: &EngineConfig,
) -> QueryAdvice {
    let mut advice = QueryAdvice {
        optimizations: Vec::new(),
        recommended_indexes: Vec::new(),
        estimated_rows: 0,
        estimated_cost: 0.0,
        index_used: None,
        strategy: choose_strategy(shape, schema, config),
    };

    for table_name in &shape.tables {
        let Some(table) = schema.table(table_name) else {
            continue;
        };
        let rows = row_estimate(table);
        let filter: Vec<String> = shape
            .filter_columns
            .iter()
            .filter(|c| table.has_column(c) || c.eq_ignore_ascii_case(ROWID_LOOKUP))
            .cloned()
            .collect();

        let (matched, lookup_cost) = match usable_index(schema, table, &filter) {
            Some((index, per_key)) => {
                if advice.index_used.is_none() {
                    advice.index_used = Some(index);
                }
                (per_key, (rows as f64 + 1.0).log2() + per_key as f64)
            }
            None if filter.is_empty() => (rows, rows as f64),
            None => {
                let column = &filter[0];
                advice.optimizations.push(Optimization {
                    kind: OptimizationKind::IndexUsage,
                    table: Some(table.name.clone()),
                    columns: filter.clone(),
                    message: format!(
                        "no index covers the filter on {}; this read scans about {rows} rows",
                        table.name
                    ),
                });
                push_recommendation(&mut advice, IndexRecommendation::single(&table.name, column));
                (rows / 10 + 1, rows as f64)
            }
        };
        advice.estimated_cost += lookup_cost;
        advice.estimated_rows = advice.estimated_rows.max(matched);

        if let Some((column, _)) = shape.order_by.first() {
            if table.has_column(column) && !sort_is_indexed(schema, table, column) {
                let sorted = matched as f64;
                advice.estimated_cost += sorted * (sorted + 1.0).log2();
                if matched > config.cursor_pagination_threshold {
                    advice.optimizations.push(Optimization {
                        kind: OptimizationKind::IndexUsage,
                        table: Some(table.name.clone()),
                        columns: vec![column.clone()],
                        message: format!(
                            "ORDER BY {column} sorts about {matched} rows without an index"
                        ),
                    });
                    push_recommendation(
                        &mut advice,
                        IndexRecommendation::single(&table.name, column),
                    );
                }
            }
        }

        if shape.projection == Projection::Star && table.columns.len() > config.wide_table_columns {
            advice.optimizations.push(Optimization {
                kind: OptimizationKind::ProjectionNarrowing,
                table: Some(table.name.clone()),
                columns: Vec::new(),
                message: format!(
                    "SELECT * on {} returns {} columns; name the columns you need",
                    table.name,
                    table.columns.len()
                ),
            });
        }
    }

    for column in &shape.leading_wildcard_likes {
        advice.optimizations.push(Optimization {
            kind: OptimizationKind::LeadingWildcardLike,
            table: shape.tables.first().cloned(),
            columns: vec![column.clone()],
            message: format!("pattern on {column} starts with a wildcard and cannot use an index"),
        });
    }

    if !shape.has_limit && advice.estimated_rows > config.max_result_rows as u64 {
        advice.optimizations.push(Optimization {
            kind: OptimizationKind::MissingLimit,
            table: shape.tables.first().cloned(),
            columns: Vec::new(),
            message: format!(
                "about {} rows match; results are paged at most {} rows at a time",
                advice.estimated_rows, config.max_result_rows
            ),
        });
    }

    match &advice.strategy {
        PaginationStrategy::Cursor { key_column, .. } => advice.optimizations.push(Optimization {
            kind: OptimizationKind::Pagination,
            table: shape.tables.first().cloned(),
            columns: vec![key_column.clone()],
            message: format!("paging by cursor on {key_column}"),
        }),
        PaginationStrategy::Offset if advice.estimated_rows > config.cursor_pagination_threshold => {
            advice.optimizations.push(Optimization {
                kind: OptimizationKind::Pagination,
                table: shape.tables.first().cloned(),
                columns: Vec::new(),
                message: "no unique sort key usable for cursor paging; deep pages will be slow"
                    .to_string(),
            })
        }
        PaginationStrategy::Offset => {}
    }
    advice
}

fn push_recommendation(advice: &mut QueryAdvice, rec: IndexRecommendation) {
    if !advice.recommended_indexes.contains(&rec) {
        advice.recommended_indexes.push(rec);
    }
}

/// Cost of locating the rows a filtered write touches.
pub fn write_lookup_cost(
    schema: &CachedDatabaseSchema,
    table: &TableSchema,
    filter_columns: &[String],
) -> (f64, Option<IndexRecommendation>) {
    let rows = row_estimate(table);
    match usable_index(schema, table, filter_columns) {
        Some((_, per_key)) => ((rows as f64 + 1.0).log2() + per_key as f64, None),
        None => {
            let rec = filter_columns
                .iter()
                .find(|c| table.has_column(c))
                .map(|c| IndexRecommendation::single(&table.name, c));
            (rows as f64, rec)
        }
    }
}
