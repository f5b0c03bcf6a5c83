use std::fs;
use std::path::Path;
use std::sync::Arc;
use storebridge::backup::{ManifestScope, list_backups, manifest_path, verify_backup};
use storebridge::catalog::schema::DatabaseKind;
use storebridge::commit::tx::{EditRequest, row};
use storebridge::config::EngineConfig;
use storebridge::driver::StoreDriver;
use storebridge::driver::sqlite::SqliteDriver;
use storebridge::error::EngineError;
use storebridge::query::plan::{col, lit};
use storebridge::{Engine, Value};
use tempfile::tempdir;

const SHOP: &str = "
    CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price INTEGER NOT NULL);
    CREATE TABLE stock (product_id INTEGER PRIMARY KEY REFERENCES products(id), qty INTEGER NOT NULL);
    INSERT INTO products (name, price) VALUES ('pen', 2), ('ink', 7), ('pad', 4);
    INSERT INTO stock (product_id, qty) VALUES (1, 10), (2, 0), (3, 5);
";

fn open(dir: &Path, config: EngineConfig) -> (Engine, Arc<SqliteDriver>) {
    let driver = Arc::new(SqliteDriver::open(dir.join("shop.sqlite")).unwrap());
    driver.execute_batch(SHOP).unwrap();
    let engine = Engine::new(config.with_backup_dir(dir.join("backups"))).unwrap();
    engine
        .register_database("shop", DatabaseKind::DirectSql, driver.clone())
        .unwrap();
    (engine, driver)
}

fn column(driver: &SqliteDriver, sql: &str) -> Vec<Value> {
    driver
        .query(sql, &[], None)
        .unwrap()
        .rows
        .into_iter()
        .map(|mut r| r.remove(0))
        .collect()
}

#[tokio::test]
async fn small_store_gets_a_whole_database_backup() {
    let dir = tempdir().unwrap();
    let (engine, _driver) = open(dir.path(), EngineConfig::default());
    let result = engine
        .execute_edit(
            EditRequest::delete("shop", "stock")
                .where_(col("qty").eq(lit(0)))
                .auto_backup(),
        )
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    let backup = result.backup_path.unwrap();
    let manifest = verify_backup(&manifest_path(&backup)).unwrap();
    assert_eq!(manifest.scope, ManifestScope::Database);
    assert_eq!(manifest.database_id, "shop");
    assert_eq!(manifest.transaction_id, result.transaction_id);
}

#[tokio::test]
async fn transaction_backups_restore_every_touched_table() {
    let dir = tempdir().unwrap();
    let (engine, driver) = open(dir.path(), EngineConfig::strict());
    let result = engine
        .execute_transaction(vec![
            EditRequest::update("shop", "products", row([("price", lit(99))]))
                .affect_all_rows()
                .auto_backup(),
            EditRequest::delete("stock", "stock"),
        ])
        .await
        .unwrap();
    // The second operation names another database.
    assert!(!result.success);
    assert!(result.backup_paths.is_empty());

    let result = engine
        .execute_transaction(vec![
            EditRequest::update("shop", "products", row([("price", lit(99))]))
                .affect_all_rows()
                .auto_backup(),
            EditRequest::delete("shop", "stock")
                .where_(col("qty").lt(lit(6)))
                .auto_backup(),
        ])
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(result.total_rows_affected, 5);
    assert_eq!(result.backup_paths.len(), 2);
    for path in &result.backup_paths {
        let manifest = verify_backup(&manifest_path(path)).unwrap();
        assert!(matches!(manifest.scope, ManifestScope::Table(_)));
        assert_eq!(manifest.transaction_id.as_deref(), Some(result.transaction_id.as_str()));
        assert!(manifest.row_count.is_some());
    }
    assert_eq!(column(&driver, "SELECT COUNT(*) FROM stock"), vec![Value::Integer(1)]);

    let restored = engine.rollback(&result.transaction_id).await.unwrap();
    assert!(restored.success, "{restored:?}");
    assert_eq!(restored.rows_affected, 6);
    assert_eq!(
        column(&driver, "SELECT price FROM products ORDER BY id"),
        vec![Value::Integer(2), Value::Integer(7), Value::Integer(4)]
    );
    assert_eq!(
        column(&driver, "SELECT qty FROM stock ORDER BY product_id"),
        vec![Value::Integer(10), Value::Integer(0), Value::Integer(5)]
    );

    let listed = list_backups(&dir.path().join("backups")).unwrap();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn tampered_backup_blocks_rollback_and_keeps_the_journal_entry() {
    let dir = tempdir().unwrap();
    let (engine, driver) = open(dir.path(), EngineConfig::strict());
    let result = engine
        .execute_edit(
            EditRequest::update("shop", "products", row([("name", lit("x"))]))
                .where_(col("id").eq(lit(1)))
                .auto_backup(),
        )
        .await
        .unwrap();
    let backup = result.backup_path.clone().unwrap();
    let tx = result.transaction_id.clone().unwrap();
    let original = fs::read(&backup).unwrap();
    fs::write(&backup, b"corrupted").unwrap();

    let err = engine.rollback(&tx).await.unwrap_err();
    assert!(matches!(err, EngineError::Backup(_)));
    assert_eq!(
        column(&driver, "SELECT name FROM products WHERE id = 1"),
        vec![Value::text("x")]
    );

    // Put the file back and the same transaction id still rolls back.
    fs::write(&backup, original).unwrap();
    let restored = engine.rollback(&tx).await.unwrap();
    assert!(restored.success);
    assert_eq!(
        column(&driver, "SELECT name FROM products WHERE id = 1"),
        vec![Value::text("pen")]
    );
}

#[tokio::test]
async fn rejected_edit_leaves_no_backup_behind() {
    let dir = tempdir().unwrap();
    let (engine, _driver) = open(dir.path(), EngineConfig::strict());
    let result = engine
        .execute_edit(
            EditRequest::update("shop", "stock", row([("product_id", lit(2))]))
                .where_(col("product_id").eq(lit(1)))
                .auto_backup(),
        )
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.backup_path.is_none());
    assert!(list_backups(&dir.path().join("backups")).unwrap().is_empty());
}

#[tokio::test]
async fn unknown_transaction_cannot_be_rolled_back() {
    let dir = tempdir().unwrap();
    let (engine, _driver) = open(dir.path(), EngineConfig::default());
    let plain = engine
        .execute_edit(EditRequest::insert(
            "shop",
            "products",
            row([("name", lit("cap")), ("price", lit(1))]),
        ))
        .await
        .unwrap();
    assert!(plain.transaction_id.is_none());
    let err = engine.rollback("no-such-transaction").await.unwrap_err();
    assert_eq!(err.code_str(), "transaction_not_found");
}
