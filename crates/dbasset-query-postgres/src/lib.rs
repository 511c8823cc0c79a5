//! PostgreSQL connector for dbasset-query
//!
//! Runs on `tokio-postgres`. Sessions are switched to read-only
//! transactions, superseded statements are cancelled with the protocol
//! cancel request, and functions are allowed when `pg_proc` marks every
//! overload immutable or stable.

pub mod dialect;
pub mod values;

pub use dialect::PostgresDialect;

use async_trait::async_trait;
use dbasset_query::{
    ConnectionInfo, Connector, ConnectorFactory, ConnectorRegistry, DataError, Datatype,
    DialectTable, FieldDescriptor, FunctionAllowList, PoolSettings, Result, SessionManager,
    StatementCanceller, TableEntry, TableListing,
};
use dbasset_query_sql::{
    classify_native_type, driver_uri, is_internal_schema, list_tables, table_entry,
    CompiledQuery, SqlBackend, SqlConnector, SqlDialect, TableRef,
};
use serde_json::Value;
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::{CancelToken, Client, NoTls};
use tracing::{debug, error, warn};

pub const CONNECTOR_TYPE: &str = "postgresql";

/// Detailed message for a failed statement
fn query_error(e: tokio_postgres::Error, sql: &str) -> DataError {
    error!("PostgreSQL query failed: {}", e);
    error!("Failed SQL: {}", sql);

    let message = if let Some(db_error) = e.as_db_error() {
        let mut msg = db_error.message().to_string();
        if let Some(detail) = db_error.detail() {
            msg.push_str(&format!("\nDetail: {}", detail));
        }
        if let Some(hint) = db_error.hint() {
            msg.push_str(&format!("\nHint: {}", hint));
        }
        msg
    } else {
        e.to_string()
    };

    DataError::QueryFailed(format!("{}\n\nQuery: {}", message, sql))
}

struct PostgresCanceller {
    token: CancelToken,
}

#[async_trait]
impl StatementCanceller for PostgresCanceller {
    async fn cancel(&self) -> Result<()> {
        self.token
            .cancel_query(NoTls)
            .await
            .map_err(|e| DataError::ConnectionFailed(format!("Cancel request failed: {}", e)))
    }
}

pub struct PostgresBackend {
    uri: String,
}

impl PostgresBackend {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: driver_uri(uri, "postgresql"),
        }
    }

    async fn query(
        &self,
        client: &Client,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        client
            .query(sql, params)
            .await
            .map_err(|e| query_error(e, sql))
    }
}

#[async_trait]
impl SessionManager for PostgresBackend {
    type Session = Client;

    async fn open(&self) -> Result<Client> {
        let (client, connection) = tokio_postgres::connect(&self.uri, NoTls)
            .await
            .map_err(|e| {
                error!("PostgreSQL connection failed: {}", e);
                DataError::ConnectionFailed(format!("PostgreSQL connection failed: {}", e))
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        if let Err(e) = client
            .batch_execute("SET default_transaction_read_only = on")
            .await
        {
            warn!("PostgreSQL refused read-only mode: {}", e);
        }
        Ok(client)
    }

    async fn reset(&self, client: &mut Client) -> Result<()> {
        client
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| DataError::ConnectionLost(e.to_string()))
    }

    fn canceller(&self, client: &Client) -> Option<Arc<dyn StatementCanceller>> {
        Some(Arc::new(PostgresCanceller {
            token: client.cancel_token(),
        }))
    }
}

#[async_trait]
impl SqlBackend for PostgresBackend {
    fn dialect(&self) -> &dyn SqlDialect {
        &PostgresDialect
    }

    async fn describe_table(
        &self,
        client: &mut Client,
        table: &TableRef,
    ) -> Result<Vec<FieldDescriptor>> {
        let sql = r#"
            SELECT
                c.column_name::text,
                c.udt_name::text,
                EXISTS (
                    SELECT 1 FROM pg_type t WHERE t.typname = c.udt_name AND t.typtype = 'e'
                ) AS is_enum,
                col_description(
                    format('%I.%I', c.table_schema, c.table_name)::regclass,
                    c.ordinal_position::int
                ) AS description
            FROM information_schema.columns c
            WHERE c.table_schema = COALESCE($1::text, current_schema())
                AND c.table_name = $2::text
            ORDER BY c.ordinal_position
        "#;
        let rows = self
            .query(client, sql, &[&table.schema, &table.table])
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let udt_name: String = row.get(1);
                let is_enum: bool = row.get(2);
                let description: Option<String> = row.get(3);
                let datatype = if is_enum {
                    Datatype::Enum
                } else {
                    classify_native_type(&udt_name)
                };
                let field = FieldDescriptor::new(name, datatype).with_native_type(udt_name);
                match description {
                    Some(description) => field.with_description(description),
                    None => field,
                }
            })
            .collect())
    }

    async fn function_allowlist(&self, client: &mut Client) -> Result<FunctionAllowList> {
        // one volatile overload disqualifies the name
        let sql = r#"
            SELECT p.proname::text
            FROM pg_proc p
            WHERE p.proname NOT LIKE 'pg\_%' AND p.proname NOT LIKE '\_%'
            GROUP BY p.proname
            HAVING bool_and(p.provolatile IN ('i', 's') AND p.prokind <> 'p')
        "#;
        let rows = self.query(client, sql, &[]).await?;
        let names: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        debug!("PostgreSQL allows {} functions", names.len());
        Ok(FunctionAllowList::new(names))
    }

    async fn fetch(&self, client: &mut Client, query: &CompiledQuery) -> Result<Vec<Vec<Value>>> {
        let params: Vec<Option<String>> = query.params.iter().map(|p| p.as_text()).collect();
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = self.query(client, &query.sql, &refs).await?;
        Ok(rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|idx| values::extract_value(row, idx))
                    .collect()
            })
            .collect())
    }

    async fn table_list(
        &self,
        client: &mut Client,
        include_internal: bool,
    ) -> Result<Vec<TableEntry>> {
        let sql = r#"
            SELECT table_schema::text, table_name::text, current_schema()::text
            FROM information_schema.tables
            ORDER BY table_schema, table_name
        "#;
        let rows = self.query(client, sql, &[]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let schema: String = row.get(0);
                let table: String = row.get(1);
                let default_schema: Option<String> = row.get(2);
                (include_internal || !is_internal_schema(&schema))
                    .then(|| table_entry(Some(&schema), &table, default_schema.as_deref()))
            })
            .collect())
    }
}

/// Factory for [`PostgresBackend`] connectors
pub struct PostgresFactory;

impl PostgresFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PostgresFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorFactory for PostgresFactory {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn dialects(&self) -> DialectTable {
        DialectTable::new(0)
            .with_dialect("postgresql", CONNECTOR_TYPE)
            .with_dialect("postgres", CONNECTOR_TYPE)
            .with_dialect("psql", CONNECTOR_TYPE)
            .with_dialect("pgdb", CONNECTOR_TYPE)
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
            PostgresBackend::new(&info.uri),
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
        let backend = PostgresBackend::new(&info.uri);
        let source = info
            .database_name()
            .unwrap_or_else(|| CONNECTOR_TYPE.to_string());
        list_tables(&backend, source, include_internal).await
    }
}

/// Register the PostgreSQL connector
pub fn register(registry: &mut ConnectorRegistry) {
    registry.register(Arc::new(PostgresFactory::new()));
}
