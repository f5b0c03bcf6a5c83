use crate::catalog::source::SourcePropertyInfo;
use crate::catalog::types::{Row, StorageType, Value};
use crate::driver::quote_ident;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Maximum nesting depth for expressions to prevent stack overflow
const MAX_EXPR_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn as_sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
    Between(String, Value, Value),
    IsNull(String),
    IsNotNull(String),
    Like(String, String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn and(self, rhs: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// Calculates the maximum nesting depth of this expression tree.
    pub fn depth(&self) -> usize {
        match self {
            Expr::Eq(_, _)
            | Expr::Ne(_, _)
            | Expr::Lt(_, _)
            | Expr::Lte(_, _)
            | Expr::Gt(_, _)
            | Expr::Gte(_, _)
            | Expr::In(_, _)
            | Expr::Between(_, _, _)
            | Expr::IsNull(_)
            | Expr::IsNotNull(_)
            | Expr::Like(_, _) => 1,
            Expr::Not(inner) => 1 + inner.depth(),
            Expr::And(left, right) | Expr::Or(left, right) => 1 + left.depth().max(right.depth()),
        }
    }

    pub fn validate_depth(&self) -> Result<(), EngineError> {
        let depth = self.depth();
        if depth > MAX_EXPR_DEPTH {
            return Err(EngineError::Validation(format!(
                "expression depth {} exceeds maximum allowed depth of {}",
                depth, MAX_EXPR_DEPTH
            )));
        }
        Ok(())
    }

    /// Every column the expression mentions, in first-seen order.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Eq(c, _)
            | Expr::Ne(c, _)
            | Expr::Lt(c, _)
            | Expr::Lte(c, _)
            | Expr::Gt(c, _)
            | Expr::Gte(c, _)
            | Expr::In(c, _)
            | Expr::Between(c, _, _)
            | Expr::IsNull(c)
            | Expr::IsNotNull(c)
            | Expr::Like(c, _) => {
                if !out.iter().any(|seen| seen.eq_ignore_ascii_case(c)) {
                    out.push(c.as_str());
                }
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.collect_columns(out);
                r.collect_columns(out);
            }
            Expr::Not(inner) => inner.collect_columns(out),
        }
    }

    /// Columns matched against a LIKE pattern that starts with `%`.
    pub fn leading_wildcard_likes(&self) -> Vec<String> {
        match self {
            Expr::Like(c, pattern) if pattern.starts_with('%') => vec![c.clone()],
            Expr::And(l, r) | Expr::Or(l, r) => {
                let mut out = l.leading_wildcard_likes();
                out.extend(r.leading_wildcard_likes());
                out
            }
            Expr::Not(inner) => inner.leading_wildcard_likes(),
            _ => Vec::new(),
        }
    }

    /// Values compared with `column`, for constraint lookups: `id = 5` yields `[5]`.
    pub fn equality_values(&self, column: &str) -> Vec<&Value> {
        match self {
            Expr::Eq(c, v) if c.eq_ignore_ascii_case(column) => vec![v],
            Expr::In(c, vs) if c.eq_ignore_ascii_case(column) => vs.iter().collect(),
            Expr::And(l, r) => {
                let mut out = l.equality_values(column);
                out.extend(r.equality_values(column));
                out
            }
            _ => Vec::new(),
        }
    }

    /// Renders parameterized SQL, appending bound values to `params`.
    pub fn to_sql(&self, params: &mut Vec<Value>) -> String {
        fn bind(value: &Value, params: &mut Vec<Value>) -> String {
            params.push(value.clone());
            format!("?{}", params.len())
        }
        match self {
            Expr::Eq(c, Value::Null) => format!("{} IS NULL", quote_ident(c)),
            Expr::Ne(c, Value::Null) => format!("{} IS NOT NULL", quote_ident(c)),
            Expr::Eq(c, v) => format!("{} = {}", quote_ident(c), bind(v, params)),
            Expr::Ne(c, v) => format!("{} <> {}", quote_ident(c), bind(v, params)),
            Expr::Lt(c, v) => format!("{} < {}", quote_ident(c), bind(v, params)),
            Expr::Lte(c, v) => format!("{} <= {}", quote_ident(c), bind(v, params)),
            Expr::Gt(c, v) => format!("{} > {}", quote_ident(c), bind(v, params)),
            Expr::Gte(c, v) => format!("{} >= {}", quote_ident(c), bind(v, params)),
            Expr::In(_, vs) if vs.is_empty() => "0".to_string(),
            Expr::In(c, vs) => {
                let placeholders: Vec<String> = vs.iter().map(|v| bind(v, params)).collect();
                format!("{} IN ({})", quote_ident(c), placeholders.join(", "))
            }
            Expr::Between(c, lo, hi) => {
                let lo = bind(lo, params);
                let hi = bind(hi, params);
                format!("{} BETWEEN {lo} AND {hi}", quote_ident(c))
            }
            Expr::IsNull(c) => format!("{} IS NULL", quote_ident(c)),
            Expr::IsNotNull(c) => format!("{} IS NOT NULL", quote_ident(c)),
            Expr::Like(c, pattern) => {
                let placeholder = bind(&Value::text(pattern.as_str()), params);
                format!("{} LIKE {placeholder}", quote_ident(c))
            }
            Expr::And(l, r) => {
                let left = l.to_sql(params);
                let right = r.to_sql(params);
                format!("({left} AND {right})")
            }
            Expr::Or(l, r) => {
                let left = l.to_sql(params);
                let right = r.to_sql(params);
                format!("({left} OR {right})")
            }
            Expr::Not(inner) => format!("NOT ({})", inner.to_sql(params)),
        }
    }
}

/// Row filter for updates, deletes and table queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhereClause {
    /// Caller-written SQL fragment with positional arguments. Screened before use.
    Raw { sql: String, args: Vec<Value> },
    Expr(Expr),
}

impl WhereClause {
    pub fn raw(sql: impl Into<String>, args: Vec<Value>) -> Self {
        WhereClause::Raw {
            sql: sql.into(),
            args,
        }
    }

    /// SQL text plus its arguments, with placeholders numbered after `offset` bound values.
    pub fn render(&self, offset: usize) -> (String, Vec<Value>) {
        match self {
            WhereClause::Raw { sql, args } => {
                if offset == 0 {
                    (format!("({sql})"), args.clone())
                } else {
                    (format!("({})", renumber_placeholders(sql, offset)), args.clone())
                }
            }
            WhereClause::Expr(expr) => {
                let mut params = vec![Value::Null; offset];
                let sql = expr.to_sql(&mut params);
                (sql, params.split_off(offset))
            }
        }
    }
}

/// Rewrites `?` and `?N` placeholders to explicit indexes shifted by `offset`.
fn renumber_placeholders(sql: &str, offset: usize) -> String {
    let Ok(scanned) = crate::query::sql::tokenize(sql) else {
        return sql.to_string();
    };
    let mut out = String::with_capacity(sql.len() + 8);
    let mut cursor = 0;
    let mut next_anonymous = 0usize;
    for token in scanned
        .tokens
        .iter()
        .filter(|t| t.kind == crate::query::sql::TokenKind::Placeholder)
    {
        let index = match token.text.strip_prefix('?') {
            Some("") => {
                next_anonymous += 1;
                next_anonymous
            }
            Some(n) => match n.parse::<usize>() {
                Ok(n) => {
                    next_anonymous = next_anonymous.max(n);
                    n
                }
                Err(_) => continue,
            },
            None => continue,
        };
        out.push_str(&sql[cursor..token.start]);
        out.push_str(&format!("?{}", index + offset));
        cursor = token.end;
    }
    out.push_str(&sql[cursor..]);
    out
}

/// Structured single-table read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableQuery {
    /// Empty means every column.
    pub select: Vec<String>,
    pub table: String,
    pub filter: Option<WhereClause>,
    pub order_by: Vec<(String, Order)>,
    pub limit: Option<usize>,
}

impl TableQuery {
    pub fn select(cols: &[&str]) -> Self {
        Self {
            select: cols
                .iter()
                .filter(|c| **c != "*")
                .map(|s| s.to_string())
                .collect(),
            table: String::new(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn from(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn where_(mut self, expr: Expr) -> Self {
        self.filter = Some(WhereClause::Expr(expr));
        self
    }

    pub fn where_raw(mut self, sql: &str, args: Vec<Value>) -> Self {
        self.filter = Some(WhereClause::raw(sql, args));
        self
    }

    pub fn order_by(mut self, col: &str, order: Order) -> Self {
        self.order_by.push((col.to_string(), order));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Columns referenced by the projection, filter and ordering.
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = self.select.clone();
        match &self.filter {
            Some(WhereClause::Expr(expr)) => {
                out.extend(expr.columns().into_iter().map(str::to_string))
            }
            Some(WhereClause::Raw { sql, .. }) => {
                out.extend(crate::query::sql::expression_columns(sql))
            }
            None => {}
        }
        out.extend(self.order_by.iter().map(|(c, _)| c.clone()));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuerySource {
    /// A read-only SQL statement with positional parameters.
    Sql { sql: String, params: Vec<Value> },
    Table(TableQuery),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Falls back to the configured default page size.
    pub page_size: Option<usize>,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub database_id: String,
    pub source: QuerySource,
    pub page: PageRequest,
    pub deadline: Option<Instant>,
}

impl QueryRequest {
    pub fn sql(database_id: &str, sql: &str, params: Vec<Value>) -> Self {
        Self {
            database_id: database_id.to_string(),
            source: QuerySource::Sql {
                sql: sql.to_string(),
                params,
            },
            page: PageRequest::default(),
            deadline: None,
        }
    }

    pub fn table(database_id: &str, query: TableQuery) -> Self {
        Self {
            database_id: database_id.to_string(),
            source: QuerySource::Table(query),
            page: PageRequest::default(),
            deadline: None,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page.page_size = Some(page_size);
        self
    }

    pub fn page_token(mut self, token: Option<String>) -> Self {
        self.page.page_token = token;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub declared_type: Option<String>,
    /// Present when the column maps to a cached table column.
    pub storage_type: Option<StorageType>,
    pub nullable: Option<bool>,
    #[serde(default)]
    pub source_property: Option<SourcePropertyInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub column_metadata: Vec<ColumnMetadata>,
    pub has_more: bool,
    pub next_page_token: Option<String>,
    pub warnings: Vec<String>,
    pub schema_version: u64,
}

pub struct ColumnRef(String);

pub fn col(name: &str) -> ColumnRef {
    ColumnRef(name.to_string())
}

pub trait IntoQueryValue {
    fn into_query_value(self) -> Value;
}

impl IntoQueryValue for Value {
    fn into_query_value(self) -> Value {
        self
    }
}

impl IntoQueryValue for bool {
    fn into_query_value(self) -> Value {
        Value::Boolean(self)
    }
}

impl IntoQueryValue for i64 {
    fn into_query_value(self) -> Value {
        Value::Integer(self)
    }
}

impl IntoQueryValue for i32 {
    fn into_query_value(self) -> Value {
        Value::Integer(self as i64)
    }
}

impl IntoQueryValue for f64 {
    fn into_query_value(self) -> Value {
        Value::Real(self)
    }
}

impl IntoQueryValue for String {
    fn into_query_value(self) -> Value {
        Value::Text(self.into())
    }
}

impl IntoQueryValue for &str {
    fn into_query_value(self) -> Value {
        Value::text(self)
    }
}

pub fn lit<T: IntoQueryValue>(value: T) -> Value {
    value.into_query_value()
}

impl ColumnRef {
    pub fn eq(self, value: Value) -> Expr {
        Expr::Eq(self.0, value)
    }

    pub fn neq(self, value: Value) -> Expr {
        Expr::Ne(self.0, value)
    }

    pub fn gt(self, value: Value) -> Expr {
        Expr::Gt(self.0, value)
    }

    pub fn gte(self, value: Value) -> Expr {
        Expr::Gte(self.0, value)
    }

    pub fn lt(self, value: Value) -> Expr {
        Expr::Lt(self.0, value)
    }

    pub fn lte(self, value: Value) -> Expr {
        Expr::Lte(self.0, value)
    }

    pub fn between(self, low: Value, high: Value) -> Expr {
        Expr::Between(self.0, low, high)
    }

    pub fn in_(self, values: Vec<Value>) -> Expr {
        Expr::In(self.0, values)
    }

    pub fn like(self, pattern: &str) -> Expr {
        Expr::Like(self.0, pattern.to_string())
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull(self.0)
    }

    pub fn is_not_null(self) -> Expr {
        Expr::IsNotNull(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expressions_render_with_quoted_identifiers_and_bound_values() {
        let expr = col("age")
            .gte(lit(18))
            .and(col("name").like("a%").or(col("email").is_null()));
        let mut params = Vec::new();
        let sql = expr.to_sql(&mut params);
        assert_eq!(
            sql,
            "(\"age\" >= ?1 AND (\"name\" LIKE ?2 OR \"email\" IS NULL))"
        );
        assert_eq!(params, vec![Value::Integer(18), Value::text("a%")]);
        assert_eq!(expr.columns(), vec!["age", "name", "email"]);
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let mut params = Vec::new();
        assert_eq!(col("id").in_(Vec::new()).to_sql(&mut params), "0");
        assert!(params.is_empty());
    }

    #[test]
    fn raw_where_placeholders_are_shifted_past_earlier_bindings() {
        let clause = WhereClause::raw("id = ? OR parent = ?", vec![lit(1), lit(2)]);
        let (sql, args) = clause.render(2);
        assert_eq!(sql, "(id = ?3 OR parent = ?4)");
        assert_eq!(args.len(), 2);

        let clause = WhereClause::Expr(col("id").eq(lit(7)));
        let (sql, args) = clause.render(1);
        assert_eq!(sql, "\"id\" = ?2");
        assert_eq!(args, vec![Value::Integer(7)]);
    }

    #[test]
    fn equality_values_walk_conjunctions_only() {
        let expr = col("id").eq(lit(1)).and(col("id").in_(vec![lit(2), lit(3)]));
        assert_eq!(expr.equality_values("id").len(), 3);
        let expr = col("id").eq(lit(1)).or(col("id").eq(lit(2)));
        assert!(expr.equality_values("id").is_empty());
    }

    #[test]
    fn deep_expressions_are_rejected() {
        let mut expr = col("a").eq(lit(1));
        for _ in 0..40 {
            expr = expr.not();
        }
        assert!(expr.validate_depth().is_err());
    }
}
