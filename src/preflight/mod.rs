//! Data-dependent checks that run against the store before (or instead of) a write.

use crate::catalog::schema::TableSchema;
use crate::catalog::types::Value;
use crate::commit::apply::{count_keyed, count_matching};
use crate::commit::tx::{ConstraintViolation, EditOperation, EditRequest};
use crate::commit::validation::{Probe, ProbeExpectation};
use crate::driver::RowSet;
use crate::error::EngineError;
use std::ops::Range;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum PreflightResult {
    Ok { affected_rows: u64 },
    Rejected { violations: Vec<ConstraintViolation> },
}

fn is_false(value: &Value) -> bool {
    match value {
        Value::Integer(v) => *v == 0,
        Value::Real(v) => *v == 0.0,
        Value::Boolean(v) => !*v,
        Value::Text(v) => v.trim().parse::<f64>().is_ok_and(|n| n == 0.0),
        Value::Null | Value::Blob(_) => false,
    }
}

fn holds(probe: &Probe, rows: &RowSet) -> bool {
    match probe.expect {
        ProbeExpectation::NoRows => rows.rows.is_empty(),
        ProbeExpectation::SomeRow => !rows.rows.is_empty(),
        ProbeExpectation::NotFalse => !rows
            .rows
            .first()
            .and_then(|row| row.first())
            .is_some_and(is_false),
    }
}

/// Runs every probe through `query`, collecting the constraints that would fail.
pub fn run_probes(
    probes: &[Probe],
    mut query: impl FnMut(&str, &[Value]) -> Result<RowSet, EngineError>,
) -> Result<Vec<ConstraintViolation>, EngineError> {
    let mut violations = Vec::new();
    for probe in probes {
        let rows = query(&probe.sql, &probe.params)?;
        if !holds(probe, &rows) {
            debug!(table = %probe.table, sql = %probe.sql, "constraint probe failed");
            violations.push(probe.violation());
        }
    }
    Ok(violations)
}

fn single_count(rows: RowSet) -> u64 {
    rows.rows
        .first()
        .and_then(|row| row.first())
        .and_then(Value::as_i64)
        .map_or(0, |n| n.max(0) as u64)
}

/// Number of rows `request` would touch, without writing anything.
pub fn count_affected(
    request: &EditRequest,
    table: &TableSchema,
    chunk: Range<usize>,
    mut query: impl FnMut(&str, &[Value]) -> Result<RowSet, EngineError>,
) -> Result<u64, EngineError> {
    let end = chunk.end.min(request.rows.len());
    let rows = &request.rows[chunk.start.min(end)..end];
    match request.operation {
        EditOperation::Insert => Ok(1),
        EditOperation::BatchInsert => Ok(rows.len() as u64),
        EditOperation::Update | EditOperation::Delete => {
            let stmt = count_matching(table, request.filter.as_ref());
            Ok(single_count(query(&stmt.sql, &stmt.params)?))
        }
        EditOperation::BatchUpdate | EditOperation::BatchDelete => {
            let mut total = 0;
            for data in rows {
                let stmt = count_keyed(table, data)?;
                total += single_count(query(&stmt.sql, &stmt.params)?).min(1);
            }
            Ok(total)
        }
    }
}

/// Probes, then counts: the full answer to "what would this edit do".
pub fn preflight(
    request: &EditRequest,
    table: &TableSchema,
    probes: &[Probe],
    chunk: Range<usize>,
    mut query: impl FnMut(&str, &[Value]) -> Result<RowSet, EngineError>,
) -> Result<PreflightResult, EngineError> {
    let violations = run_probes(probes, &mut query)?;
    if !violations.is_empty() {
        return Ok(PreflightResult::Rejected { violations });
    }
    Ok(PreflightResult::Ok {
        affected_rows: count_affected(request, table, chunk, query)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::loader::build_snapshot;
    use crate::catalog::schema::DatabaseKind;
    use crate::commit::tx::{ConstraintType, row};
    use crate::commit::validation::validate_edit;
    use crate::config::EngineConfig;
    use crate::driver::StoreDriver;
    use crate::driver::sqlite::SqliteDriver;
    use crate::query::plan::{col, lit};

    fn driver() -> SqliteDriver {
        let driver = SqliteDriver::open_in_memory().unwrap();
        driver
            .execute_batch(
                "CREATE TABLE accounts (id INTEGER PRIMARY KEY, handle TEXT NOT NULL UNIQUE, \
                 balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0));
                 INSERT INTO accounts (handle, balance) VALUES ('ann', 5), ('bo', 0), ('cy', 9);",
            )
            .unwrap();
        driver
    }

    fn check(driver: &SqliteDriver, request: &EditRequest) -> PreflightResult {
        let catalog = driver.introspect(None).unwrap();
        let schema = build_snapshot("db", DatabaseKind::DirectSql, catalog, Vec::new(), 1, 0);
        let (result, probes) =
            validate_edit(request, &schema, &EngineConfig::default(), 0..usize::MAX);
        assert!(result.valid, "{:?}", result);
        let table = schema.table(&request.table_name).unwrap();
        preflight(request, table, &probes, 0..usize::MAX, |sql, params| {
            driver.query(sql, params, None)
        })
        .unwrap()
    }

    #[test]
    fn duplicate_unique_value_is_rejected() {
        let driver = driver();
        let request = EditRequest::insert("db", "accounts", row([("handle", lit("bo"))]));
        let PreflightResult::Rejected { violations } = check(&driver, &request) else {
            panic!("expected a rejection");
        };
        assert_eq!(violations[0].constraint_type, ConstraintType::Unique);
    }

    #[test]
    fn failing_check_expression_is_rejected() {
        let driver = driver();
        let request = EditRequest::insert(
            "db",
            "accounts",
            row([("handle", lit("dee")), ("balance", lit(-3))]),
        );
        let PreflightResult::Rejected { violations } = check(&driver, &request) else {
            panic!("expected a rejection");
        };
        assert_eq!(violations[0].constraint_type, ConstraintType::Check);
    }

    #[test]
    fn counts_rows_a_filtered_update_would_touch() {
        let driver = driver();
        let request = EditRequest::update("db", "accounts", row([("balance", lit(1))]))
            .where_(col("balance").gt(lit(1)));
        assert_eq!(
            check(&driver, &request),
            PreflightResult::Ok { affected_rows: 2 }
        );
        let request = EditRequest::batch_delete(
            "db",
            "accounts",
            vec![row([("id", lit(1))]), row([("id", lit(40))])],
        );
        assert_eq!(
            check(&driver, &request),
            PreflightResult::Ok { affected_rows: 1 }
        );
    }
}
