//! Queries through the engine against a SQLite census file

use dbasset_query::{
    ConnectionInfo, ConnectorRegistry, DataError, Datatype, EngineConfig, FormattedOutput,
    QueryEngine, QueryParams,
};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TOWNS: &[(&str, Option<i64>, &str)] = &[
    ("ABINGTON", Some(15985), "Town"),
    ("ACTON", Some(21924), "Town"),
    ("BOSTON", Some(617594), "City"),
    ("BOURNE", Some(19754), "Town"),
    ("BOXBOROUGH", Some(4996), "Town"),
    ("BOXFORD", Some(7965), "Town"),
    ("BOYLSTON", Some(4355), "Town"),
    ("BRAINTREE", Some(35744), "City"),
    ("BREWSTER", Some(9820), "Town"),
    ("CAMBRIDGE", Some(105162), "City"),
    ("WESTON", None, "Town"),
];

struct Fixture {
    _dir: TempDir,
    path: PathBuf,
    uri: String,
    engine: Arc<QueryEngine>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("census.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE towns (town TEXT, pop2010 INTEGER, type TEXT)")
        .unwrap();
    for (town, pop, kind) in TOWNS {
        conn.execute(
            "INSERT INTO towns VALUES (?1, ?2, ?3)",
            rusqlite::params![town, pop, kind],
        )
        .unwrap();
    }
    drop(conn);

    let mut registry = ConnectorRegistry::new();
    dbasset_query_sqlite::register(&mut registry);
    Fixture {
        uri: format!("sqlite:///{}", path.display()),
        path,
        _dir: dir,
        engine: Arc::new(QueryEngine::new(registry, EngineConfig::default())),
    }
}

impl Fixture {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo::new(&self.uri).with_table("towns")
    }

    async fn raw(&self, params: QueryParams) -> dbasset_query::Result<Vec<u8>> {
        let output = self.engine.query_database("towns", &self.info(), &params).await?;
        Ok(output.stream_factory().unwrap().collect().await.unwrap())
    }

    async fn json(&self, params: QueryParams) -> dbasset_query::Result<Value> {
        Ok(serde_json::from_slice(&self.raw(params).await?).unwrap())
    }
}

fn towns(body: &Value) -> Vec<String> {
    body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row[0].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_equality_filter() {
    let fixture = fixture();
    let body = fixture
        .json(
            QueryParams::new()
                .with("filters", r#"[["town", "BOSTON"]]"#)
                .with("fields", "town"),
        )
        .await
        .unwrap();
    assert_eq!(body["data"], json!([["BOSTON"]]));
}

#[tokio::test]
async fn test_range_filter_sorted_and_limited() {
    let fixture = fixture();
    let body = fixture
        .json(
            QueryParams::new()
                .with("filters", r#"[["town", ">=", "BOS"]]"#)
                .with("sort", "town")
                .with("limit", 5),
        )
        .await
        .unwrap();
    assert_eq!(
        towns(&body),
        vec!["BOSTON", "BOURNE", "BOXBOROUGH", "BOXFORD", "BOYLSTON"]
    );
    assert_eq!(body["datacount"], json!(5));
    assert_eq!(body["columns"], json!({"town": 0, "pop2010": 1, "type": 2}));
}

#[tokio::test]
async fn test_csv_output() {
    let fixture = fixture();
    let output = fixture
        .engine
        .query_database(
            "towns",
            &fixture.info(),
            &QueryParams::new()
                .with("format", "csv")
                .with("fields", "town,pop2010")
                .with("limit", 5),
        )
        .await
        .unwrap();
    assert_eq!(output.mime_type(), Some("text/csv"));
    let FormattedOutput::Stream { .. } = &output else {
        panic!("csv should stream");
    };
    let bytes = output.stream_factory().unwrap().collect().await.unwrap();
    let text = String::from_utf8(bytes).unwrap();
    assert_eq!(text.lines().count(), 6);
    assert_eq!(text.lines().next(), Some("town,pop2010"));
}

#[tokio::test]
async fn test_limit_zero_and_none() {
    let fixture = fixture();
    let empty = fixture.json(QueryParams::new().with("limit", 0)).await.unwrap();
    assert_eq!(empty["data"], json!([]));
    assert_eq!(empty["fields"], json!(["town", "pop2010", "type"]));

    let all = fixture.json(QueryParams::new().with("limit", "none")).await.unwrap();
    assert_eq!(all["datacount"], json!(TOWNS.len()));
}

#[tokio::test]
async fn test_offset_pages_agree_with_full_listing() {
    let fixture = fixture();
    let full = fixture
        .json(QueryParams::new().with("sort", "town").with("limit", "none"))
        .await
        .unwrap();
    let page = fixture
        .json(
            QueryParams::new()
                .with("sort", "town")
                .with("offset", 2)
                .with("limit", 3),
        )
        .await
        .unwrap();
    assert_eq!(towns(&page), towns(&full)[2..5].to_vec());

    let tail = fixture
        .json(
            QueryParams::new()
                .with("sort", "town")
                .with("offset", 9)
                .with("limit", "none"),
        )
        .await
        .unwrap();
    assert_eq!(towns(&tail), vec!["CAMBRIDGE", "WESTON"]);
}

#[tokio::test]
async fn test_regex_and_search() {
    let fixture = fixture();
    let body = fixture
        .json(
            QueryParams::new()
                .with("filters", r#"[["town", "search", "^bo"]]"#)
                .with("sort", "town"),
        )
        .await
        .unwrap();
    assert_eq!(
        towns(&body),
        vec!["BOSTON", "BOURNE", "BOXBOROUGH", "BOXFORD", "BOYLSTON"]
    );

    let body = fixture
        .json(QueryParams::new().with("filters", r#"[["town", "regex", "^bo"]]"#))
        .await
        .unwrap();
    assert_eq!(body["datacount"], json!(0));

    let body = fixture
        .json(
            QueryParams::new()
                .with("filters", r#"[["town", "not_regex", "O"]]"#)
                .with("sort", "town"),
        )
        .await
        .unwrap();
    assert_eq!(towns(&body), vec!["BRAINTREE", "BREWSTER", "CAMBRIDGE"]);
}

#[tokio::test]
async fn test_null_comparison() {
    let fixture = fixture();
    let body = fixture
        .json(QueryParams::new().with("filters", r#"[["pop2010", "is", null]]"#))
        .await
        .unwrap();
    assert_eq!(towns(&body), vec!["WESTON"]);

    let body = fixture
        .json(QueryParams::new().with("filters", r#"[["pop2010", "not_is", null]]"#))
        .await
        .unwrap();
    assert_eq!(body["datacount"], json!(TOWNS.len() - 1));
}

#[tokio::test]
async fn test_group_with_count() {
    let fixture = fixture();
    let body = fixture
        .json(
            QueryParams::new()
                .with("fields", r#"["type", {"func": "count", "reference": "n"}]"#)
                .with("group", "type")
                .with("sort", "type"),
        )
        .await
        .unwrap();
    assert_eq!(body["data"], json!([["City", 3], ["Town", 8]]));
    assert_eq!(body["columns"], json!({"type": 0, "n": 1}));
}

#[tokio::test]
async fn test_field_info() {
    let fixture = fixture();
    let connector = fixture.engine.connector("towns", &fixture.info()).await.unwrap();
    let fields = connector.field_info().await.unwrap();
    let kinds: Vec<(&str, Datatype)> = fields
        .iter()
        .map(|field| (field.name.as_str(), field.datatype))
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("town", Datatype::String),
            ("pop2010", Datatype::Number),
            ("type", Datatype::String),
        ]
    );
}

#[tokio::test]
async fn test_table_listing() {
    let fixture = fixture();
    let listing = fixture
        .engine
        .list_tables(&ConnectionInfo::new(&fixture.uri), false)
        .await
        .unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].source, "census.db");
    assert_eq!(listing[0].tables[0].name, "towns");
}

#[tokio::test]
async fn test_missing_file() {
    let fixture = fixture();
    let info = ConnectionInfo::new("sqlite:////nonexistent/census.db").with_table("towns");
    let err = fixture
        .engine
        .query_database("missing", &info, &QueryParams::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::InvalidConfiguration(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_client_interrupts_running_statement() {
    let fixture = fixture();
    // Real towns first, then an unbounded run of generated names
    Connection::open(&fixture.path)
        .unwrap()
        .execute_batch(
            "CREATE VIEW endless AS
               WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n)
               SELECT town FROM towns
               UNION ALL
               SELECT 'GENERATED ' || x FROM n",
        )
        .unwrap();
    let info = ConnectionInfo::new(&fixture.uri).with_table("endless");
    let lookup = |pattern: &str| {
        QueryParams::new()
            .with("clientid", "viewer-1")
            .with("fields", "town")
            .with("limit", 1)
            .with("filters", json!([["town", "regex", pattern]]).to_string())
    };

    // Opens and pools the client's session
    let warm = fixture
        .engine
        .query_database("endless", &info, &lookup("^BOSTON$"))
        .await
        .unwrap();
    drop(warm);

    let running = tokio::spawn({
        let engine = fixture.engine.clone();
        let info = info.clone();
        let params = lookup("^NOWHERE$");
        async move { engine.query_database("endless", &info, &params).await.map(|_| ()) }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!running.is_finished());

    let output = tokio::time::timeout(
        Duration::from_secs(10),
        fixture
            .engine
            .query_database("endless", &info, &lookup("^CAMBRIDGE$")),
    )
    .await
    .expect("superseding query did not finish")
    .unwrap();
    let body: Value =
        serde_json::from_slice(&output.stream_factory().unwrap().collect().await.unwrap())
            .unwrap();
    assert_eq!(body["data"], json!([["CAMBRIDGE"]]));

    let first = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, Err(DataError::Cancelled)));

    // The reused session keeps serving the client
    let output = fixture
        .engine
        .query_database("endless", &info, &lookup("^ACTON$"))
        .await
        .unwrap();
    let body: Value =
        serde_json::from_slice(&output.stream_factory().unwrap().collect().await.unwrap())
            .unwrap();
    assert_eq!(body["data"], json!([["ACTON"]]));
}
