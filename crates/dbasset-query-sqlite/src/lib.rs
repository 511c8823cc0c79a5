//! SQLite connector for dbasset-query
//!
//! Database files are opened read-only through `rusqlite`, with statements
//! run on the blocking thread pool. Regular-expression operators are backed
//! by `regex_match` / `regex_search` functions registered on every
//! connection.

pub mod dialect;

pub use dialect::{SqliteDialect, BUILTIN_FUNCTIONS};

use async_trait::async_trait;
use dbasset_query::{
    ConnectionInfo, Connector, ConnectorFactory, ConnectorRegistry, DataError, DialectTable,
    FieldDescriptor, FunctionAllowList, PoolSettings, Result, SessionManager,
    StatementCanceller, TableEntry, TableListing,
};
use dbasset_query_sql::{
    classify_native_type, list_tables, sqlite_path, table_entry, CompiledQuery, SqlBackend,
    SqlConnector, SqlDialect, SqlParam, TableRef,
};
use regex::{Regex, RegexBuilder};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use serde_json::{Number, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

pub const CONNECTOR_TYPE: &str = "sqlite";

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn sqlite_error(e: rusqlite::Error, sql: &str) -> DataError {
    if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
        debug!("SQLite statement interrupted: {}", sql);
        return DataError::Cancelled;
    }
    error!("SQLite query failed: {}", e);
    error!("Failed SQL: {}", sql);
    DataError::QueryFailed(format!("{}\n\nQuery: {}", e, sql))
}

/// Text of a cell for regex matching; blobs and nulls have none
fn cell_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Null | ValueRef::Blob(_) => None,
    }
}

fn cell_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }
    }
}

fn bound_value(param: &SqlParam) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match param {
        SqlParam::Null => Sql::Null,
        SqlParam::Bool(b) => Sql::Integer(i64::from(*b)),
        SqlParam::Int(i) => Sql::Integer(*i),
        SqlParam::Float(f) => Sql::Real(*f),
        SqlParam::Text(s) => Sql::Text(s.clone()),
    }
}

/// Register `regex_match` (case-sensitive) and `regex_search`
/// (case-insensitive) as `fn(value, pattern) -> bool`
pub fn register_regex_functions(conn: &Connection) -> rusqlite::Result<()> {
    for (name, case_insensitive) in [("regex_match", false), ("regex_search", true)] {
        conn.create_scalar_function(
            name,
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            move |ctx| {
                let regex: Arc<Regex> = ctx.get_or_create_aux(1, |pattern| -> std::result::Result<Regex, BoxError> {
                    Ok(RegexBuilder::new(pattern.as_str()?)
                        .case_insensitive(case_insensitive)
                        .build()?)
                })?;
                Ok(cell_text(ctx.get_raw(0)).map(|text| regex.is_match(&text)))
            },
        )?;
    }
    Ok(())
}

/// A connection shared with the blocking pool, plus its interrupt handle
#[derive(Clone)]
pub struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteSession {
    /// Run `f` against the connection on the blocking thread pool
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite worker failed: {}", e)))?
    }
}

struct SqliteInterrupt {
    handle: Arc<InterruptHandle>,
}

#[async_trait]
impl StatementCanceller for SqliteInterrupt {
    async fn cancel(&self) -> Result<()> {
        self.handle.interrupt();
        Ok(())
    }
}

#[derive(Debug)]
pub struct SqliteBackend {
    path: PathBuf,
}

impl SqliteBackend {
    /// Backend for the file named by `uri`, which must exist
    pub fn new(uri: &str) -> Result<Self> {
        let path = sqlite_path(uri).ok_or_else(|| {
            DataError::invalid_configuration(format!("No database file in {}", uri))
        })?;
        let path = PathBuf::from(path);
        if !path.is_file() {
            return Err(DataError::invalid_configuration(format!(
                "SQLite database file does not exist: {}",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_read_only(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch("PRAGMA query_only = ON")?;
    register_regex_functions(&conn)?;
    Ok(conn)
}

#[async_trait]
impl SessionManager for SqliteBackend {
    type Session = SqliteSession;

    async fn open(&self) -> Result<SqliteSession> {
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || open_read_only(&path))
            .await
            .map_err(|e| DataError::Internal(format!("SQLite worker failed: {}", e)))?
            .map_err(|e| {
                error!("SQLite open failed: {}", e);
                DataError::ConnectionFailed(format!("SQLite open failed: {}", e))
            })?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(SqliteSession {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }

    async fn reset(&self, session: &mut SqliteSession) -> Result<()> {
        session
            .run(|conn| {
                if conn.is_autocommit() {
                    return Ok(());
                }
                conn.execute_batch("ROLLBACK")
                    .map_err(|e| DataError::ConnectionLost(e.to_string()))
            })
            .await
    }

    fn canceller(&self, session: &SqliteSession) -> Option<Arc<dyn StatementCanceller>> {
        Some(Arc::new(SqliteInterrupt {
            handle: session.interrupt.clone(),
        }))
    }
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    fn dialect(&self) -> &dyn SqlDialect {
        &SqliteDialect
    }

    async fn describe_table(
        &self,
        session: &mut SqliteSession,
        table: &TableRef,
    ) -> Result<Vec<FieldDescriptor>> {
        let name = table.table.clone();
        session
            .run(move |conn| {
                let sql = "SELECT name, type FROM pragma_table_info(?1)";
                let mut stmt = conn.prepare(sql).map_err(|e| sqlite_error(e, sql))?;
                let columns = stmt
                    .query_map([&name], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                    })
                    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                    .map_err(|e| sqlite_error(e, sql))?;
                Ok(columns
                    .into_iter()
                    .map(|(column, declared)| {
                        let declared = declared.unwrap_or_default();
                        let field = FieldDescriptor::new(column, classify_native_type(&declared));
                        if declared.is_empty() {
                            field
                        } else {
                            field.with_native_type(declared)
                        }
                    })
                    .collect())
            })
            .await
    }

    async fn function_allowlist(&self, _session: &mut SqliteSession) -> Result<FunctionAllowList> {
        Ok(FunctionAllowList::new(BUILTIN_FUNCTIONS.iter().copied()))
    }

    async fn fetch(
        &self,
        session: &mut SqliteSession,
        query: &CompiledQuery,
    ) -> Result<Vec<Vec<Value>>> {
        let sql = query.sql.clone();
        let params: Vec<rusqlite::types::Value> = query.params.iter().map(bound_value).collect();
        session
            .run(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(|e| sqlite_error(e, &sql))?;
                let width = stmt.column_count();
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params), |row| {
                        (0..width)
                            .map(|idx| row.get_ref(idx).map(cell_value))
                            .collect::<rusqlite::Result<Vec<_>>>()
                    })
                    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                    .map_err(|e| sqlite_error(e, &sql))?;
                Ok(rows)
            })
            .await
    }

    async fn table_list(
        &self,
        session: &mut SqliteSession,
        include_internal: bool,
    ) -> Result<Vec<TableEntry>> {
        session
            .run(move |conn| {
                let sql = "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') ORDER BY name";
                let mut stmt = conn.prepare(sql).map_err(|e| sqlite_error(e, sql))?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                    .map_err(|e| sqlite_error(e, sql))?;
                Ok(names
                    .into_iter()
                    .filter(|name| include_internal || !name.starts_with("sqlite_"))
                    .map(|name| table_entry(None, &name, None))
                    .collect())
            })
            .await
    }
}

/// Factory for [`SqliteBackend`] connectors
#[derive(Default)]
pub struct SqliteFactory;

#[async_trait]
impl ConnectorFactory for SqliteFactory {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn dialects(&self) -> DialectTable {
        DialectTable::new(0)
            .with_dialect("sqlite", CONNECTOR_TYPE)
            .with_dialect("sqlitedb", CONNECTOR_TYPE)
            .with_default(CONNECTOR_TYPE)
    }

    fn validate(&self, info: &ConnectionInfo) -> Result<()> {
        info.require_table()?;
        SqliteBackend::new(&info.uri).map(|_| ())
    }

    async fn create(
        &self,
        info: &ConnectionInfo,
        _dialect: &str,
        pool: PoolSettings,
    ) -> Result<Arc<dyn Connector>> {
        let backend = SqliteBackend::new(&info.uri)?;
        let table = TableRef::new(None, info.require_table()?);
        Ok(Arc::new(SqlConnector::new(CONNECTOR_TYPE, backend, table, pool)))
    }

    async fn table_list(
        &self,
        info: &ConnectionInfo,
        _dialect: &str,
        include_internal: bool,
    ) -> Result<Vec<TableListing>> {
        let backend = SqliteBackend::new(&info.uri)?;
        let source = info
            .database_name()
            .unwrap_or_else(|| CONNECTOR_TYPE.to_string());
        list_tables(&backend, source, include_internal).await
    }
}

/// Register the SQLite connector
pub fn register(registry: &mut ConnectorRegistry) {
    registry.register(Arc::new(SqliteFactory));
}
