//! MySQL / MariaDB connector for dbasset-query, on the `sqlx` MySQL driver

pub mod dialect;

pub use dialect::{MySqlDialect, BUILTIN_FUNCTIONS};

use async_trait::async_trait;
use dbasset_query::{
    ConnectionInfo, Connector, ConnectorFactory, ConnectorRegistry, DataError, Datatype,
    DialectTable, FieldDescriptor, FunctionAllowList, PoolSettings, Result, SessionManager,
    StatementCanceller, TableEntry, TableListing,
};
use dbasset_query_sql::{
    classify_native_type, driver_uri, is_internal_schema, list_tables, table_entry,
    CompiledQuery, SqlBackend, SqlConnector, SqlDialect, SqlParam, TableRef,
};
use serde_json::{Number, Value};
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, Connection, Executor, MySql, MySqlConnection, Row, TypeInfo};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const CONNECTOR_TYPE: &str = "mysql";

fn query_error(e: sqlx::Error, sql: &str) -> DataError {
    error!("MySQL query failed: {}", e);
    error!("Failed SQL: {}", sql);
    let message = match e.as_database_error() {
        Some(db_error) => db_error.message().to_string(),
        None => e.to_string(),
    };
    DataError::QueryFailed(format!("{}\n\nQuery: {}", message, sql))
}

async fn connect(uri: &str) -> Result<MySqlConnection> {
    MySqlConnection::connect(uri).await.map_err(|e| {
        error!("MySQL connection failed: {}", e);
        DataError::ConnectionFailed(format!("MySQL connection failed: {}", e))
    })
}

fn bind<'q>(sql: &'q str, params: &[SqlParam]) -> Query<'q, MySql, MySqlArguments> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(b) => query.bind(*b),
        SqlParam::Int(i) => query.bind(*i),
        SqlParam::Float(f) => query.bind(*f),
        SqlParam::Text(s) => query.bind(s.clone()),
    })
}

fn float(v: f64) -> Option<Value> {
    Number::from_f64(v).map(Value::Number)
}

/// Value of column `idx`, dispatched on the reported column type
fn extract_value(row: &MySqlRow, idx: usize) -> Value {
    let type_name = row.columns()[idx].type_info().name().to_string();
    let value = match type_name.as_str() {
        "NULL" => None,
        "BOOLEAN" => row.try_get::<Option<bool>, _>(idx).ok().flatten().map(Value::Bool),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(Value::from),
        name if name.ends_with("UNSIGNED") => row
            .try_get::<Option<u64>, _>(idx)
            .ok()
            .flatten()
            .map(Value::from),
        "FLOAT" | "DOUBLE" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .and_then(float),
        "DECIMAL" => row
            .try_get_unchecked::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .and_then(|text| match text.parse::<i64>() {
                Ok(i) => Some(Value::from(i)),
                Err(_) => text.parse::<f64>().ok().and_then(float),
            }),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string())),
        "TIME" => row
            .try_get::<Option<chrono::NaiveTime>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string())),
        "DATETIME" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string())),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_rfc3339())),
        "JSON" => row
            .try_get::<Option<Json<Value>>, _>(idx)
            .ok()
            .flatten()
            .map(|json| json.0),
        _ => row.try_get::<Option<String>, _>(idx).ok().flatten().map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

fn text(row: &MySqlRow, idx: usize) -> Option<String> {
    row.try_get::<Option<String>, _>(idx).ok().flatten()
}

/// A connection plus the server-side id `KILL QUERY` needs
pub struct MySqlSession {
    conn: MySqlConnection,
    connection_id: u64,
}

struct KillQuery {
    uri: String,
    connection_id: u64,
}

#[async_trait]
impl StatementCanceller for KillQuery {
    async fn cancel(&self) -> Result<()> {
        let mut side = connect(&self.uri).await?;
        let sql = format!("KILL QUERY {}", self.connection_id);
        let outcome = Executor::execute(&mut side, sqlx::raw_sql(&sql)).await;
        if let Err(e) = side.close().await {
            debug!("Closing side connection failed: {}", e);
        }
        outcome
            .map(|_| ())
            .map_err(|e| DataError::QueryFailed(format!("KILL QUERY failed: {}", e)))
    }
}

pub struct MySqlBackend {
    uri: String,
}

impl MySqlBackend {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: driver_uri(uri, "mysql"),
        }
    }

    async fn rows(
        &self,
        session: &mut MySqlSession,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<MySqlRow>> {
        bind(sql, params)
            .fetch_all(&mut session.conn)
            .await
            .map_err(|e| query_error(e, sql))
    }
}

#[async_trait]
impl SessionManager for MySqlBackend {
    type Session = MySqlSession;

    async fn open(&self) -> Result<MySqlSession> {
        let mut conn = connect(&self.uri).await?;
        if let Err(e) = Executor::execute(&mut conn, sqlx::raw_sql("SET SESSION TRANSACTION READ ONLY"))
            .await
        {
            warn!("MySQL refused read-only mode: {}", e);
        }
        let connection_id: u64 = sqlx::query_scalar::<MySql, u64>("SELECT CONNECTION_ID()")
            .fetch_one(&mut conn)
            .await
            .map_err(|e| DataError::ConnectionFailed(e.to_string()))?;
        Ok(MySqlSession {
            conn,
            connection_id,
        })
    }

    async fn reset(&self, session: &mut MySqlSession) -> Result<()> {
        Executor::execute(&mut session.conn, sqlx::raw_sql("ROLLBACK"))
            .await
            .map(|_| ())
            .map_err(|e| DataError::ConnectionLost(e.to_string()))
    }

    fn canceller(&self, session: &MySqlSession) -> Option<Arc<dyn StatementCanceller>> {
        Some(Arc::new(KillQuery {
            uri: self.uri.clone(),
            connection_id: session.connection_id,
        }))
    }
}

#[async_trait]
impl SqlBackend for MySqlBackend {
    fn dialect(&self) -> &dyn SqlDialect {
        &MySqlDialect
    }

    async fn describe_table(
        &self,
        session: &mut MySqlSession,
        table: &TableRef,
    ) -> Result<Vec<FieldDescriptor>> {
        let sql = "SELECT CAST(column_name AS CHAR), CAST(column_type AS CHAR), \
                   CAST(data_type AS CHAR), CAST(column_comment AS CHAR) \
                   FROM information_schema.columns \
                   WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ? \
                   ORDER BY ordinal_position";
        let params = [
            table
                .schema
                .clone()
                .map(SqlParam::Text)
                .unwrap_or(SqlParam::Null),
            SqlParam::Text(table.table.clone()),
        ];
        let rows = self.rows(session, sql, &params).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = text(row, 0)?;
                let column_type = text(row, 1).unwrap_or_default();
                let data_type = text(row, 2).unwrap_or_default().to_lowercase();
                let datatype = match data_type.as_str() {
                    "enum" | "set" => Datatype::Enum,
                    "tinyint" if column_type.starts_with("tinyint(1)") => Datatype::Boolean,
                    _ => classify_native_type(&column_type),
                };
                let field = FieldDescriptor::new(name, datatype).with_native_type(column_type);
                Some(match text(row, 3).filter(|comment| !comment.is_empty()) {
                    Some(comment) => field.with_description(comment),
                    None => field,
                })
            })
            .collect())
    }

    async fn function_allowlist(&self, session: &mut MySqlSession) -> Result<FunctionAllowList> {
        let sql = "SELECT CAST(routine_name AS CHAR) FROM information_schema.routines \
                   WHERE routine_schema = DATABASE() AND routine_type = 'FUNCTION' \
                   AND is_deterministic = 'YES' AND sql_data_access <> 'MODIFIES SQL DATA'";
        let rows = self.rows(session, sql, &[]).await?;
        let routines: Vec<String> = rows.iter().filter_map(|row| text(row, 0)).collect();
        debug!("MySQL allows {} stored functions", routines.len());
        Ok(FunctionAllowList::new(
            BUILTIN_FUNCTIONS
                .iter()
                .map(|name| name.to_string())
                .chain(routines),
        ))
    }

    async fn fetch(
        &self,
        session: &mut MySqlSession,
        query: &CompiledQuery,
    ) -> Result<Vec<Vec<Value>>> {
        let rows = self.rows(session, &query.sql, &query.params).await?;
        Ok(rows
            .iter()
            .map(|row| (0..row.len()).map(|idx| extract_value(row, idx)).collect())
            .collect())
    }

    async fn table_list(
        &self,
        session: &mut MySqlSession,
        include_internal: bool,
    ) -> Result<Vec<TableEntry>> {
        let sql = "SELECT CAST(table_schema AS CHAR), CAST(table_name AS CHAR), \
                   CAST(DATABASE() AS CHAR) FROM information_schema.tables \
                   ORDER BY table_schema, table_name";
        let rows = self.rows(session, sql, &[]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let schema = text(row, 0)?;
                let table = text(row, 1)?;
                let current = text(row, 2);
                (include_internal || !is_internal_schema(&schema))
                    .then(|| table_entry(Some(&schema), &table, current.as_deref()))
            })
            .collect())
    }
}

/// Factory for [`MySqlBackend`] connectors
#[derive(Default)]
pub struct MySqlFactory;

#[async_trait]
impl ConnectorFactory for MySqlFactory {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn dialects(&self) -> DialectTable {
        DialectTable::new(0)
            .with_dialect("mysql", CONNECTOR_TYPE)
            .with_dialect("mariadb", CONNECTOR_TYPE)
            .with_default(CONNECTOR_TYPE)
    }

    fn validate(&self, info: &ConnectionInfo) -> Result<()> {
        info.require_table()?;
        Ok(())
    }

    async fn create(
        &self,
        info: &ConnectionInfo,
        _dialect: &str,
        pool: PoolSettings,
    ) -> Result<Arc<dyn Connector>> {
        let table = TableRef::new(info.schema.clone(), info.require_table()?);
        Ok(Arc::new(SqlConnector::new(
            CONNECTOR_TYPE,
            MySqlBackend::new(&info.uri),
            table,
            pool,
        )))
    }

    async fn table_list(
        &self,
        info: &ConnectionInfo,
        _dialect: &str,
        include_internal: bool,
    ) -> Result<Vec<TableListing>> {
        let backend = MySqlBackend::new(&info.uri);
        let source = info
            .database_name()
            .unwrap_or_else(|| CONNECTOR_TYPE.to_string());
        list_tables(&backend, source, include_internal).await
    }
}

/// Register the MySQL connector
pub fn register(registry: &mut ConnectorRegistry) {
    registry.register(Arc::new(MySqlFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mariadb_uri_uses_mysql_driver() {
        let backend = MySqlBackend::new("mariadb+pymysql://u:p@db:3306/census");
        assert_eq!(backend.uri, "mysql://u:p@db:3306/census");
    }

    #[test]
    fn test_dialects() {
        let mut registry = ConnectorRegistry::new();
        register(&mut registry);
        let resolved = registry.resolve("mariadb://db/census", None).unwrap();
        assert_eq!(resolved.factory.connector_type(), CONNECTOR_TYPE);
        assert_eq!(resolved.dialect, "mysql");
    }
}
