//! Generic ANSI connector on the `sqlx` Any driver.
//!
//! Serves PostgreSQL, MySQL and SQLite URIs when no native connector is
//! registered, or when `sql` is requested as the connector type. Only
//! column types the Any driver can represent are supported.

use crate::backend::{is_internal_schema, list_tables, table_entry, SqlBackend, SqlConnector};
use crate::compiler::{is_type_name, CompiledQuery, TableRef};
use crate::dialect::{classify_native_type, SqlDialect, SqlParam, ANSI_OPERATORS};
use async_trait::async_trait;
use dbasset_query::{
    ConnectionInfo, Connector, ConnectorFactory, DataError, DialectTable, FieldDescriptor,
    FunctionAllowList, OperatorId, PoolSettings, Result, SessionManager, StatementCanceller,
    TableEntry, TableListing,
};
use serde_json::Value;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Connection, Executor, Row};
use std::sync::{Arc, Once};
use tracing::{debug, error, warn};

pub const GENERIC_CONNECTOR_TYPE: &str = "sql";

const POSTGRESQL: &str = "postgresql";
const MYSQL: &str = "mysql";
const SQLITE: &str = "sqlite";

/// Replace the dialect part of `uri`'s scheme (including any `+driver`
/// suffix) with `scheme`
pub fn driver_uri(uri: &str, scheme: &str) -> String {
    match uri.split_once("://") {
        Some((_, rest)) => format!("{scheme}://{rest}"),
        None => uri.to_string(),
    }
}

/// File path of a `sqlite:///relative` or `sqlite:////absolute` URI
pub fn sqlite_path(uri: &str) -> Option<String> {
    let (_, rest) = uri.split_once("://")?;
    let rest = rest.split(['?', '#']).next()?;
    let path = rest.strip_prefix('/')?;
    (!path.is_empty()).then(|| path.to_string())
}

/// ANSI SQL with the per-engine differences the Any driver exposes
#[derive(Debug, Clone)]
pub struct GenericDialect {
    dialect: String,
}

impl GenericDialect {
    pub fn new(dialect: impl Into<String>) -> Self {
        Self {
            dialect: dialect.into(),
        }
    }
}

impl SqlDialect for GenericDialect {
    fn name(&self) -> &str {
        &self.dialect
    }

    fn operators(&self) -> &'static [OperatorId] {
        &ANSI_OPERATORS
    }

    fn quote_identifier(&self, ident: &str) -> String {
        if self.dialect == MYSQL {
            format!("`{}`", ident.replace('`', "``"))
        } else {
            format!("\"{}\"", ident.replace('"', "\"\""))
        }
    }

    fn placeholder(&self, index: usize, native_type: Option<&str>, _value: &SqlParam) -> String {
        if self.dialect != POSTGRESQL {
            return "?".to_string();
        }
        match native_type.filter(|native| is_type_name(native)) {
            Some(native) => format!("${index}::{native}"),
            None => format!("${index}"),
        }
    }

    fn null_safe_equal(&self) -> &'static str {
        match self.dialect.as_str() {
            MYSQL => "<=>",
            SQLITE => "IS",
            _ => "IS NOT DISTINCT FROM",
        }
    }

    fn limit_clause(&self, limit: Option<u64>, offset: u64) -> String {
        match (self.dialect.as_str(), limit, offset) {
            (MYSQL, None, offset) if offset > 0 => {
                format!(" LIMIT 18446744073709551615 OFFSET {offset}")
            }
            (SQLITE, None, offset) if offset > 0 => format!(" LIMIT -1 OFFSET {offset}"),
            (_, Some(limit), 0) => format!(" LIMIT {limit}"),
            (_, Some(limit), offset) => format!(" LIMIT {limit} OFFSET {offset}"),
            (_, None, 0) => String::new(),
            (_, None, offset) => format!(" OFFSET {offset}"),
        }
    }
}

/// A connection plus the server-side id used to cancel its statements
pub struct GenericSession {
    conn: AnyConnection,
    backend_id: Option<i64>,
}

/// Cancels a statement from a side connection; SQLite has no such hook
/// through the Any driver
struct ServerCancel {
    uri: String,
    dialect: String,
    backend_id: i64,
}

/// Statement interrupting the session `backend_id` on `dialect`
fn cancel_statement(dialect: &str, backend_id: i64) -> Option<String> {
    match dialect {
        POSTGRESQL => Some(format!("SELECT pg_cancel_backend({backend_id})")),
        MYSQL => Some(format!("KILL QUERY {backend_id}")),
        _ => None,
    }
}

/// Query returning the server-side id of the current session
fn backend_id_query(dialect: &str) -> Option<&'static str> {
    match dialect {
        POSTGRESQL => Some("SELECT CAST(pg_backend_pid() AS BIGINT)"),
        MYSQL => Some("SELECT CAST(CONNECTION_ID() AS SIGNED)"),
        _ => None,
    }
}

#[async_trait]
impl StatementCanceller for ServerCancel {
    async fn cancel(&self) -> Result<()> {
        let Some(sql) = cancel_statement(&self.dialect, self.backend_id) else {
            return Ok(());
        };
        install_drivers();
        let mut side = AnyConnection::connect(&self.uri)
            .await
            .map_err(|e| DataError::ConnectionFailed(e.to_string()))?;
        let outcome = Executor::execute(&mut side, sqlx::raw_sql(&sql)).await;
        if let Err(e) = side.close().await {
            debug!("Closing side connection failed: {}", e);
        }
        outcome
            .map(|_| ())
            .map_err(|e| DataError::QueryFailed(format!("Statement cancel failed: {}", e)))
    }
}

pub struct GenericBackend {
    uri: String,
    dialect: GenericDialect,
}

impl GenericBackend {
    pub fn new(uri: &str, dialect: &str) -> Result<Self> {
        let uri = match dialect {
            POSTGRESQL => driver_uri(uri, "postgres"),
            MYSQL => driver_uri(uri, "mysql"),
            SQLITE => {
                let path = sqlite_path(uri).ok_or_else(|| {
                    DataError::invalid_configuration(format!("No database file in {uri}"))
                })?;
                format!("sqlite://{path}?mode=ro")
            }
            other => {
                return Err(DataError::invalid_configuration(format!(
                    "The generic connector does not support the {other} dialect"
                )))
            }
        };
        Ok(Self {
            uri,
            dialect: GenericDialect::new(dialect),
        })
    }

    fn query<'q>(&self, sql: &'q str, params: &[SqlParam]) -> Query<'q, Any, AnyArguments<'q>> {
        params
            .iter()
            .fold(sqlx::query(sql), |query, param| match param {
                SqlParam::Null => query.bind(None::<String>),
                SqlParam::Bool(b) => query.bind(*b),
                SqlParam::Int(i) => query.bind(*i),
                SqlParam::Float(f) => query.bind(*f),
                SqlParam::Text(s) => query.bind(s.clone()),
            })
    }

    async fn rows(
        &self,
        session: &mut AnyConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<AnyRow>> {
        self.query(sql, params)
            .fetch_all(&mut *session)
            .await
            .map_err(|e| query_error(e, sql))
    }
}

fn query_error(e: sqlx::Error, sql: &str) -> DataError {
    error!("Generic SQL query failed: {}", e);
    error!("Failed SQL: {}", sql);
    let message = match e.as_database_error() {
        Some(db_error) => db_error.message().to_string(),
        None => e.to_string(),
    };
    DataError::QueryFailed(format!("{}\n\nQuery: {}", message, sql))
}

/// Decode one cell by trying the value kinds the Any driver supports
fn extract_value(row: &AnyRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    row.try_get::<Option<String>, _>(idx)
        .ok()
        .flatten()
        .map(Value::String)
        .unwrap_or(Value::Null)
}

fn text(row: &AnyRow, idx: usize) -> Option<String> {
    row.try_get::<Option<String>, _>(idx).ok().flatten()
}

#[async_trait]
impl SessionManager for GenericBackend {
    type Session = GenericSession;

    async fn open(&self) -> Result<GenericSession> {
        install_drivers();
        let mut conn = AnyConnection::connect(&self.uri).await.map_err(|e| {
            error!("Generic SQL connection failed: {}", e);
            DataError::ConnectionFailed(format!("{} connection failed: {}", self.dialect.name(), e))
        })?;
        let read_only = match self.dialect.name() {
            POSTGRESQL => "SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY",
            MYSQL => "SET SESSION TRANSACTION READ ONLY",
            _ => "PRAGMA query_only = ON",
        };
        if let Err(e) = Executor::execute(&mut conn, sqlx::raw_sql(read_only)).await {
            warn!("Could not switch session to read-only mode: {}", e);
        }
        let backend_id = match backend_id_query(self.dialect.name()) {
            Some(sql) => match sqlx::query_scalar::<_, i64>(sql).fetch_one(&mut conn).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!("Statements on this session cannot be cancelled: {}", e);
                    None
                }
            },
            None => None,
        };
        Ok(GenericSession { conn, backend_id })
    }

    async fn reset(&self, session: &mut GenericSession) -> Result<()> {
        if self.dialect.name() == SQLITE {
            return Ok(());
        }
        Executor::execute(&mut session.conn, sqlx::raw_sql("ROLLBACK"))
            .await
            .map(|_| ())
            .map_err(|e| DataError::ConnectionLost(e.to_string()))
    }

    fn canceller(&self, session: &GenericSession) -> Option<Arc<dyn StatementCanceller>> {
        let backend_id = session.backend_id?;
        Some(Arc::new(ServerCancel {
            uri: self.uri.clone(),
            dialect: self.dialect.name().to_string(),
            backend_id,
        }))
    }
}

#[async_trait]
impl SqlBackend for GenericBackend {
    fn dialect(&self) -> &dyn SqlDialect {
        &self.dialect
    }

    async fn describe_table(
        &self,
        session: &mut GenericSession,
        table: &TableRef,
    ) -> Result<Vec<FieldDescriptor>> {
        let name = SqlParam::Text(table.table.clone());
        let (sql, params) = match self.dialect.name() {
            POSTGRESQL => (
                "SELECT column_name::text, udt_name::text FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                vec![
                    SqlParam::Text(table.schema.clone().unwrap_or_else(|| "public".into())),
                    name,
                ],
            ),
            MYSQL => (
                "SELECT CAST(column_name AS CHAR), CAST(column_type AS CHAR) \
                 FROM information_schema.columns \
                 WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ? \
                 ORDER BY ordinal_position",
                vec![
                    table
                        .schema
                        .clone()
                        .map(SqlParam::Text)
                        .unwrap_or(SqlParam::Null),
                    name,
                ],
            ),
            _ => ("SELECT name, type FROM pragma_table_info(?)", vec![name]),
        };
        let rows = self.rows(&mut session.conn, sql, &params).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let column = text(row, 0)?;
                let native = text(row, 1).unwrap_or_default();
                let descriptor = FieldDescriptor::new(column, classify_native_type(&native));
                Some(if native.is_empty() {
                    descriptor
                } else {
                    descriptor.with_native_type(native)
                })
            })
            .collect())
    }

    async fn function_allowlist(&self, _session: &mut GenericSession) -> Result<FunctionAllowList> {
        Ok(FunctionAllowList::known_safe())
    }

    async fn fetch(
        &self,
        session: &mut GenericSession,
        query: &CompiledQuery,
    ) -> Result<Vec<Vec<Value>>> {
        let rows = self.rows(&mut session.conn, &query.sql, &query.params).await?;
        Ok(rows
            .iter()
            .map(|row| (0..row.len()).map(|idx| extract_value(row, idx)).collect())
            .collect())
    }

    async fn table_list(
        &self,
        session: &mut GenericSession,
        include_internal: bool,
    ) -> Result<Vec<TableEntry>> {
        let sql = match self.dialect.name() {
            POSTGRESQL => {
                "SELECT table_schema::text, table_name::text, 'public' FROM information_schema.tables \
                 ORDER BY table_schema, table_name"
            }
            MYSQL => {
                "SELECT CAST(table_schema AS CHAR), CAST(table_name AS CHAR), CAST(DATABASE() AS CHAR) \
                 FROM information_schema.tables ORDER BY table_schema, table_name"
            }
            _ => {
                "SELECT NULL, name, NULL FROM sqlite_master WHERE type IN ('table', 'view') \
                 ORDER BY name"
            }
        };
        let rows = self.rows(&mut session.conn, sql, &[]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let schema = text(row, 0);
                let table = text(row, 1)?;
                let default_schema = text(row, 2);
                let internal = match &schema {
                    Some(schema) => is_internal_schema(schema),
                    None => table.starts_with("sqlite_"),
                };
                (include_internal || !internal).then(|| {
                    table_entry(schema.as_deref(), &table, default_schema.as_deref())
                })
            })
            .collect())
    }
}

fn install_drivers() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(sqlx::any::install_default_drivers);
}

/// Factory for the generic connector
pub struct GenericSqlFactory;

impl GenericSqlFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GenericSqlFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorFactory for GenericSqlFactory {
    fn connector_type(&self) -> &'static str {
        GENERIC_CONNECTOR_TYPE
    }

    fn dialects(&self) -> DialectTable {
        DialectTable::new(1)
            .with_dialect("postgresql", POSTGRESQL)
            .with_dialect("postgres", POSTGRESQL)
            .with_dialect("mysql", MYSQL)
            .with_dialect("mariadb", MYSQL)
            .with_dialect("sqlite", SQLITE)
    }

    fn validate(&self, info: &ConnectionInfo) -> Result<()> {
        info.require_table()?;
        if info.dialect().is_none() {
            return Err(DataError::NoDialect);
        }
        Ok(())
    }

    async fn create(
        &self,
        info: &ConnectionInfo,
        dialect: &str,
        pool: PoolSettings,
    ) -> Result<Arc<dyn Connector>> {
        let table = TableRef::new(info.schema.clone(), info.require_table()?);
        let backend = GenericBackend::new(&info.uri, dialect)?;
        debug!("Creating generic {} connector for {}", dialect, table.table);
        Ok(Arc::new(SqlConnector::new(
            GENERIC_CONNECTOR_TYPE,
            backend,
            table,
            pool,
        )))
    }

    async fn table_list(
        &self,
        info: &ConnectionInfo,
        dialect: &str,
        include_internal: bool,
    ) -> Result<Vec<TableListing>> {
        let backend = GenericBackend::new(&info.uri, dialect)?;
        let source = info.database_name().unwrap_or_else(|| dialect.to_string());
        list_tables(&backend, source, include_internal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_uri() {
        assert_eq!(
            driver_uri("postgresql+psycopg2://u:p@db/census", "postgres"),
            "postgres://u:p@db/census"
        );
        assert_eq!(driver_uri("not a uri", "sqlite"), "not a uri");
    }

    #[test]
    fn test_sqlite_uri_is_read_only() {
        let backend = GenericBackend::new("sqlite:////tmp/towns.db", SQLITE).unwrap();
        assert_eq!(backend.uri, "sqlite:///tmp/towns.db?mode=ro");
        let backend = GenericBackend::new("sqlite:///data/towns.db?x=1", SQLITE).unwrap();
        assert_eq!(backend.uri, "sqlite://data/towns.db?mode=ro");
        assert!(GenericBackend::new("sqlite://", SQLITE).is_err());
        assert!(GenericBackend::new("oracle://db", "oracle").is_err());
    }

    #[test]
    fn test_server_side_cancel_statements() {
        assert_eq!(
            cancel_statement(POSTGRESQL, 4711).as_deref(),
            Some("SELECT pg_cancel_backend(4711)")
        );
        assert_eq!(cancel_statement(MYSQL, 12).as_deref(), Some("KILL QUERY 12"));
        assert_eq!(cancel_statement(SQLITE, 1), None);
        assert!(backend_id_query(POSTGRESQL).is_some());
        assert!(backend_id_query(MYSQL).is_some());
        assert!(backend_id_query(SQLITE).is_none());
    }

    #[test]
    fn test_dialect_differences() {
        let mysql = GenericDialect::new(MYSQL);
        assert_eq!(mysql.quote_identifier("a`b"), "`a``b`");
        assert_eq!(mysql.limit_clause(None, 5), " LIMIT 18446744073709551615 OFFSET 5");
        assert_eq!(mysql.null_safe_equal(), "<=>");

        let sqlite = GenericDialect::new(SQLITE);
        assert_eq!(sqlite.limit_clause(None, 5), " LIMIT -1 OFFSET 5");
        assert_eq!(sqlite.placeholder(1, Some("TEXT"), &SqlParam::Int(1)), "?");

        let pg = GenericDialect::new(POSTGRESQL);
        assert_eq!(pg.placeholder(2, Some("int4"), &SqlParam::Int(1)), "$2::int4");
        assert_eq!(pg.placeholder(2, Some("bad;type"), &SqlParam::Int(1)), "$2");
        assert_eq!(pg.limit_clause(Some(3), 0), " LIMIT 3");
        assert!(!pg.operators().contains(&OperatorId::Regex));
    }
}
