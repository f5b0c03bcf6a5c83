use std::collections::BTreeSet;
use std::sync::Arc;
use storebridge::catalog::schema::DatabaseKind;
use storebridge::config::EngineConfig;
use storebridge::driver::sqlite::SqliteDriver;
use storebridge::error::EngineError;
use storebridge::query::plan::{Order, QueryRequest, TableQuery, col, lit};
use storebridge::query::planner::PaginationStrategy;
use storebridge::{Engine, Value};

const ROWS: i64 = 2500;

fn engine() -> Engine {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let driver = SqliteDriver::open_in_memory().unwrap();
    driver
        .execute_batch(&format!(
            "CREATE TABLE readings (id INTEGER PRIMARY KEY, sensor TEXT NOT NULL, value INTEGER NOT NULL);
             CREATE INDEX readings_sensor ON readings (sensor);
             WITH RECURSIVE seq(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM seq WHERE x < {ROWS})
             INSERT INTO readings (sensor, value) SELECT 's' || (x % 7), x * 3 FROM seq;"
        ))
        .unwrap();
    engine
        .register_database("metrics", DatabaseKind::DirectSql, Arc::new(driver))
        .unwrap();
    engine
}

fn by_id() -> TableQuery {
    TableQuery::select(&["id", "value"])
        .from("readings")
        .order_by("id", Order::Asc)
}

#[tokio::test]
async fn large_keyed_table_uses_cursor_pagination() {
    let engine = engine();
    let explanation = engine
        .explain_query(&QueryRequest::table("metrics", by_id()).page_size(100))
        .await
        .unwrap();
    assert_eq!(
        explanation.strategy,
        PaginationStrategy::Cursor {
            key_column: "id".into(),
            order: Order::Asc,
        }
    );
    assert!(!explanation.rewritten_sql.contains("OFFSET"));
}

#[tokio::test]
async fn same_token_returns_the_same_page() {
    let engine = engine();
    let first = engine
        .execute_query(QueryRequest::table("metrics", by_id()).page_size(100))
        .await
        .unwrap();
    let token = first.next_page_token.clone();
    assert!(token.is_some());

    let again = engine
        .execute_query(
            QueryRequest::table("metrics", by_id())
                .page_size(100)
                .page_token(token.clone()),
        )
        .await
        .unwrap();
    let once_more = engine
        .execute_query(
            QueryRequest::table("metrics", by_id())
                .page_size(100)
                .page_token(token),
        )
        .await
        .unwrap();
    assert_eq!(again.rows, once_more.rows);
    assert_eq!(again.next_page_token, once_more.next_page_token);
    assert_eq!(again.rows[0][0], Value::Integer(101));
}

#[tokio::test]
async fn offset_fallback_is_idempotent_too() {
    let engine = engine();
    let request = || {
        QueryRequest::sql(
            "metrics",
            "SELECT sensor, COUNT(*) AS n FROM readings GROUP BY sensor ORDER BY sensor",
            Vec::new(),
        )
        .page_size(3)
    };
    let first = engine.execute_query(request()).await.unwrap();
    assert_eq!(first.rows.len(), 3);
    assert!(first.has_more);

    let a = engine
        .execute_query(request().page_token(first.next_page_token.clone()))
        .await
        .unwrap();
    let b = engine
        .execute_query(request().page_token(first.next_page_token.clone()))
        .await
        .unwrap();
    assert_eq!(a.rows, b.rows);
    assert_eq!(a.rows[0][0], Value::text("s3"));
}

#[tokio::test]
async fn walking_every_page_sees_each_row_once() {
    let engine = engine();
    let mut seen = BTreeSet::new();
    let mut token = None;
    let mut pages = 0;
    loop {
        let page = engine
            .execute_query(
                QueryRequest::table("metrics", by_id())
                    .page_size(400)
                    .page_token(token.clone()),
            )
            .await
            .unwrap();
        pages += 1;
        for row in &page.rows {
            assert!(seen.insert(row[0].as_i64().unwrap()), "row repeated");
        }
        if !page.has_more {
            assert!(page.next_page_token.is_none());
            break;
        }
        token = page.next_page_token;
    }
    assert_eq!(pages, 7);
    assert_eq!(seen.len() as i64, ROWS);
}

#[tokio::test]
async fn filtered_cursor_pages_stay_inside_the_filter() {
    let engine = engine();
    let query = || {
        TableQuery::select(&["id", "sensor"])
            .from("readings")
            .where_(col("sensor").eq(lit("s1")))
            .order_by("id", Order::Desc)
    };
    let first = engine
        .execute_query(QueryRequest::table("metrics", query()).page_size(50))
        .await
        .unwrap();
    let second = engine
        .execute_query(
            QueryRequest::table("metrics", query())
                .page_size(50)
                .page_token(first.next_page_token.clone()),
        )
        .await
        .unwrap();
    let last_first = first.rows.last().unwrap()[0].as_i64().unwrap();
    let first_second = second.rows[0][0].as_i64().unwrap();
    assert!(first_second < last_first);
    assert!(second
        .rows
        .iter()
        .all(|row| row[1] == Value::text("s1")));
}

#[tokio::test]
async fn tokens_from_another_query_are_refused() {
    let engine = engine();
    let first = engine
        .execute_query(QueryRequest::table("metrics", by_id()).page_size(10))
        .await
        .unwrap();
    let other = TableQuery::select(&["id"]).from("readings");
    let err = engine
        .execute_query(
            QueryRequest::table("metrics", other)
                .page_size(10)
                .page_token(first.next_page_token),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPageToken(_)));

    let err = engine
        .execute_query(
            QueryRequest::table("metrics", by_id()).page_token(Some("zz".into())),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code_str(), "invalid_page_token");
}

#[tokio::test]
async fn page_size_is_capped_by_max_result_rows() {
    let engine = engine();
    let page = engine
        .execute_query(QueryRequest::table("metrics", by_id()).page_size(5000))
        .await
        .unwrap();
    assert_eq!(page.rows.len(), 1000);
    assert!(page.has_more);
}
