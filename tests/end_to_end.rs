use std::sync::Arc;
use storebridge::catalog::schema::DatabaseKind;
use storebridge::commit::tx::{ConstraintType, EditRequest, row};
use storebridge::config::EngineConfig;
use storebridge::driver::sqlite::SqliteDriver;
use storebridge::query::plan::{QueryRequest, col, lit};
use storebridge::{Engine, Value};
use tempfile::tempdir;

const EVENTS: &str =
    "CREATE TABLE events (id INTEGER PRIMARY KEY, ts INTEGER NOT NULL, label TEXT);";

fn engine(dir: &std::path::Path) -> Engine {
    let engine = Engine::new(EngineConfig::default().with_backup_dir(dir.join("backups"))).unwrap();
    let driver = SqliteDriver::open(dir.join("events.sqlite")).unwrap();
    driver.execute_batch(EVENTS).unwrap();
    engine
        .register_database("events", DatabaseKind::DirectSql, Arc::new(driver))
        .unwrap();
    engine
}

#[tokio::test]
async fn insert_update_delete_then_read_nothing() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    let inserted = engine
        .execute_edit(EditRequest::insert(
            "events",
            "events",
            row([("ts", lit(100)), ("label", lit("a"))]),
        ))
        .await
        .unwrap();
    assert!(inserted.success, "{inserted:?}");
    assert_eq!(inserted.rows_affected, 1);
    let id = inserted.last_insert_id.expect("insert returns the new id");

    let updated = engine
        .execute_edit(
            EditRequest::update("events", "events", row([("label", lit("b"))]))
                .where_(col("id").eq(lit(id))),
        )
        .await
        .unwrap();
    assert!(updated.success, "{updated:?}");
    assert_eq!(updated.rows_affected, 1);

    let seen = engine
        .execute_query(QueryRequest::sql(
            "events",
            "SELECT label FROM events WHERE id = ?",
            vec![Value::Integer(id)],
        ))
        .await
        .unwrap();
    assert_eq!(seen.rows, vec![vec![Value::text("b")]]);

    let deleted = engine
        .execute_edit(EditRequest::delete("events", "events").where_(col("id").eq(lit(id))))
        .await
        .unwrap();
    assert!(deleted.success, "{deleted:?}");
    assert_eq!(deleted.rows_affected, 1);

    let after = engine
        .execute_query(QueryRequest::sql(
            "events",
            "SELECT * FROM events WHERE id = ?",
            vec![Value::Integer(id)],
        ))
        .await
        .unwrap();
    assert!(after.rows.is_empty());
    assert!(!after.has_more);
    assert_eq!(after.column_metadata.len(), 3);
}

#[tokio::test]
async fn string_into_integer_column_names_the_column() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());

    let rejected = engine
        .execute_edit(EditRequest::insert(
            "events",
            "events",
            row([("ts", lit("thirty"))]),
        ))
        .await
        .unwrap();
    assert!(!rejected.success);
    let violation = &rejected.constraint_violations[0];
    assert_eq!(violation.constraint_type, ConstraintType::DataType);
    assert_eq!(violation.column.as_deref(), Some("ts"));

    let accepted = engine
        .execute_edit(EditRequest::insert("events", "events", row([("ts", lit(30))])))
        .await
        .unwrap();
    assert!(accepted.success);
    assert!(accepted.constraint_violations.is_empty());
}

#[tokio::test]
async fn missing_not_null_value_is_rejected_before_the_store_sees_it() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());
    let rejected = engine
        .execute_edit(EditRequest::insert(
            "events",
            "events",
            row([("label", lit("no ts"))]),
        ))
        .await
        .unwrap();
    assert!(!rejected.success);
    assert_eq!(
        rejected.constraint_violations[0].constraint_type,
        ConstraintType::NotNull
    );
    let count = engine
        .execute_query(QueryRequest::sql("events", "SELECT COUNT(*) FROM events", Vec::new()))
        .await
        .unwrap();
    assert_eq!(count.rows[0][0], Value::Integer(0));
}

#[tokio::test]
async fn delete_everything_requires_the_override() {
    let dir = tempdir().unwrap();
    let engine = engine(dir.path());
    for ts in 0..4 {
        let result = engine
            .execute_edit(EditRequest::insert("events", "events", row([("ts", lit(ts))])))
            .await
            .unwrap();
        assert!(result.success);
    }

    let refused = engine
        .execute_edit(EditRequest::delete("events", "events"))
        .await
        .unwrap();
    assert!(!refused.success);
    assert_eq!(
        refused.constraint_violations[0].constraint_type,
        ConstraintType::UnscopedMutation
    );

    let confirmed = engine
        .execute_edit(EditRequest::delete("events", "events").affect_all_rows())
        .await
        .unwrap();
    assert!(confirmed.success);
    assert_eq!(confirmed.rows_affected, 4);
}
