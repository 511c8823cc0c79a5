//! Generic connector against an on-disk SQLite database

use dbasset_query::{
    ConnectionInfo, ConnectorRegistry, DataError, EngineConfig, QueryEngine, QueryParams,
};
use serde_json::{json, Value};
use sqlx::{Connection, SqliteConnection};
use tempfile::TempDir;

async fn census_db() -> (TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("census.db");
    let mut conn = SqliteConnection::connect(&format!("sqlite://{}?mode=rwc", path.display()))
        .await
        .unwrap();
    sqlx::raw_sql(
        "CREATE TABLE towns (town TEXT, pop2010 INTEGER);
         INSERT INTO towns VALUES ('ABINGTON', 15985), ('BOSTON', 617594), ('CAMBRIDGE', 105162);",
    )
    .execute(&mut conn)
    .await
    .unwrap();
    conn.close().await.unwrap();
    let uri = format!("sqlite:///{}", path.display());
    (dir, uri)
}

fn engine() -> QueryEngine {
    let mut registry = ConnectorRegistry::new();
    dbasset_query_sql::register(&mut registry);
    QueryEngine::new(registry, EngineConfig::default())
}

async fn query(engine: &QueryEngine, uri: &str, params: QueryParams) -> dbasset_query::Result<Value> {
    let info = ConnectionInfo::new(uri).with_table("towns");
    let output = engine.query_database("towns", &info, &params).await?;
    let bytes = output.stream_factory().unwrap().collect().await.unwrap();
    Ok(serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_filter_and_sort() {
    let (_dir, uri) = census_db().await;
    let engine = engine();
    let body = query(
        &engine,
        &uri,
        QueryParams::new()
            .with("filters", r#"[["pop2010", ">", 20000]]"#)
            .with("sort", "town")
            .with("sortdir", "desc"),
    )
    .await
    .unwrap();
    assert_eq!(
        body["data"],
        json!([["CAMBRIDGE", 105162], ["BOSTON", 617594]])
    );
    assert_eq!(body["datacount"], json!(2));
}

#[tokio::test]
async fn test_regex_is_rejected() {
    let (_dir, uri) = census_db().await;
    let err = query(
        &engine(),
        &uri,
        QueryParams::new().with("filters", r#"[["town", "regex", "^B"]]"#),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, DataError::OperatorNotAllowed { .. }));
}

#[tokio::test]
async fn test_table_listing() {
    let (_dir, uri) = census_db().await;
    let listing = engine()
        .list_tables(&ConnectionInfo::new(&uri), false)
        .await
        .unwrap();
    assert_eq!(listing[0].source, "census.db");
    let names: Vec<&str> = listing[0].tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["towns"]);
}
