use crate::compiler::{CompiledQuery, SqlCompiler, TableRef};
use crate::dialect::SqlDialect;
use async_trait::async_trait;
use dbasset_query::{
    run_cancellable, Connector, ConnectorCapabilities, DataError, FieldDescriptor,
    FunctionAllowList, PoolSettings, Result, Rows, SelectQuery, SelectResult, SessionManager,
    SessionPool, TableEntry, TableListing,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Driver side of a relational connector
///
/// Implementations own connection setup through [`SessionManager`] and run
/// statements produced by the shared compiler.
#[async_trait]
pub trait SqlBackend: SessionManager {
    fn dialect(&self) -> &dyn SqlDialect;

    /// Columns of `table` in ordinal order; empty when the table is missing
    async fn describe_table(
        &self,
        session: &mut Self::Session,
        table: &TableRef,
    ) -> Result<Vec<FieldDescriptor>>;

    /// Functions the backend considers free of side effects
    async fn function_allowlist(&self, session: &mut Self::Session) -> Result<FunctionAllowList>;

    /// Run a compiled select and return rows in column order
    async fn fetch(
        &self,
        session: &mut Self::Session,
        query: &CompiledQuery,
    ) -> Result<Vec<Vec<Value>>>;

    async fn table_list(
        &self,
        session: &mut Self::Session,
        include_internal: bool,
    ) -> Result<Vec<TableEntry>>;
}

/// Connector serving one table through a [`SqlBackend`]
pub struct SqlConnector<B: SqlBackend> {
    source_type: &'static str,
    table: TableRef,
    pool: SessionPool<B>,
    fields: OnceCell<Arc<Vec<FieldDescriptor>>>,
    functions: OnceCell<Arc<FunctionAllowList>>,
}

impl<B: SqlBackend> SqlConnector<B> {
    /// Must be called inside a tokio runtime; the session pool starts its
    /// sweeper here
    pub fn new(source_type: &'static str, backend: B, table: TableRef, settings: PoolSettings) -> Self {
        Self {
            source_type,
            table,
            pool: SessionPool::new(backend, settings),
            fields: OnceCell::new(),
            functions: OnceCell::new(),
        }
    }

    pub fn backend(&self) -> &B {
        self.pool.manager()
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn pool(&self) -> &SessionPool<B> {
        &self.pool
    }

    /// Compile `query` against this table without running it
    pub async fn compile(&self, query: &SelectQuery) -> Result<CompiledQuery> {
        let fields = self.field_info().await?;
        SqlCompiler::new(self.backend().dialect(), &fields).compile_select(&self.table, query)
    }
}

#[async_trait]
impl<B: SqlBackend> Connector for SqlConnector<B> {
    fn source_type(&self) -> &'static str {
        self.source_type
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities::relational(self.backend().dialect().operators())
    }

    async fn field_info(&self) -> Result<Arc<Vec<FieldDescriptor>>> {
        self.fields
            .get_or_try_init(|| async {
                let mut pooled = self.pool.acquire(None).await?;
                let fields = self
                    .backend()
                    .describe_table(pooled.session()?, &self.table)
                    .await?;
                if fields.is_empty() {
                    return Err(DataError::SchemaError(format!(
                        "Table {} not found or has no columns",
                        self.table.table
                    )));
                }
                debug!(
                    "Described {} columns of {}",
                    fields.len(),
                    self.table.table
                );
                Ok(Arc::new(fields))
            })
            .await
            .cloned()
    }

    async fn function_allowlist(&self) -> Result<Arc<FunctionAllowList>> {
        self.functions
            .get_or_try_init(|| async {
                let mut pooled = self.pool.acquire(None).await?;
                let functions = self
                    .backend()
                    .function_allowlist(pooled.session()?)
                    .await?
                    .with_known_safe();
                debug!("{} functions allowed on {}", functions.len(), self.source_type);
                Ok(Arc::new(functions))
            })
            .await
            .cloned()
    }

    async fn perform_select(&self, query: &SelectQuery) -> Result<SelectResult> {
        let compiled = self.compile(query).await?;
        debug!("Executing query: {}", compiled.sql);

        let mut pooled = self.pool.acquire(query.client_id.as_deref()).await?;
        let token = pooled.token().clone();
        let session = pooled.session()?;
        let rows = run_cancellable(&token, self.backend().fetch(session, &compiled)).await?;

        debug!("Query returned {} rows", rows.len());
        Ok(SelectResult::new(
            query.limit,
            query.offset,
            query.sort.clone(),
            query.fields.clone(),
            Rows::List(rows),
        ))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close_all();
        Ok(())
    }
}

/// Open a throwaway session and list the tables of `source`
pub async fn list_tables<B: SqlBackend>(
    backend: &B,
    source: String,
    include_internal: bool,
) -> Result<Vec<TableListing>> {
    let mut session = backend.open().await?;
    let tables = backend.table_list(&mut session, include_internal).await?;
    Ok(vec![TableListing { source, tables }])
}

/// Catalog schemas hidden from table listings by default
pub fn is_internal_schema(schema: &str) -> bool {
    matches!(
        schema,
        "information_schema" | "pg_catalog" | "mysql" | "performance_schema" | "sys"
    ) || schema.starts_with("pg_toast")
}

/// Table entry named bare inside `default_schema`, else `schema.table`
pub fn table_entry(schema: Option<&str>, table: &str, default_schema: Option<&str>) -> TableEntry {
    match schema {
        Some(schema) if Some(schema) != default_schema => TableEntry {
            name: format!("{schema}.{table}"),
            native_name: table.to_string(),
            schema: Some(schema.to_string()),
        },
        _ => TableEntry {
            name: table.to_string(),
            native_name: table.to_string(),
            schema: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::ANSI_OPERATORS;
    use dbasset_query::{
        Datatype, FieldScope, OperatorId, QueryParams, StatementCanceller,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct AnsiDialect;

    impl SqlDialect for AnsiDialect {
        fn name(&self) -> &str {
            "ansi"
        }

        fn operators(&self) -> &'static [OperatorId] {
            &ANSI_OPERATORS
        }
    }

    #[derive(Default)]
    struct RecordingBackend {
        describes: AtomicUsize,
        statements: Mutex<Vec<CompiledQuery>>,
    }

    #[async_trait]
    impl SessionManager for RecordingBackend {
        type Session = ();

        async fn open(&self) -> Result<()> {
            Ok(())
        }

        async fn reset(&self, _session: &mut ()) -> Result<()> {
            Ok(())
        }

        fn canceller(&self, _session: &()) -> Option<Arc<dyn StatementCanceller>> {
            None
        }
    }

    #[async_trait]
    impl SqlBackend for RecordingBackend {
        fn dialect(&self) -> &dyn SqlDialect {
            &AnsiDialect
        }

        async fn describe_table(
            &self,
            _session: &mut (),
            table: &TableRef,
        ) -> Result<Vec<FieldDescriptor>> {
            self.describes.fetch_add(1, Ordering::SeqCst);
            if table.table != "towns" {
                return Ok(Vec::new());
            }
            Ok(vec![
                FieldDescriptor::new("town", Datatype::String).with_native_type("text"),
                FieldDescriptor::new("pop2010", Datatype::Number).with_native_type("integer"),
            ])
        }

        async fn function_allowlist(&self, _session: &mut ()) -> Result<FunctionAllowList> {
            Ok(FunctionAllowList::new(["upper"]))
        }

        async fn fetch(&self, _session: &mut (), query: &CompiledQuery) -> Result<Vec<Vec<Value>>> {
            self.statements.lock().unwrap().push(query.clone());
            Ok(vec![vec![Value::from("BOSTON"), Value::from(617594)]])
        }

        async fn table_list(
            &self,
            _session: &mut (),
            include_internal: bool,
        ) -> Result<Vec<TableEntry>> {
            let mut tables = vec![table_entry(Some("public"), "towns", Some("public"))];
            if include_internal {
                tables.push(table_entry(Some("information_schema"), "tables", Some("public")));
            }
            Ok(tables)
        }
    }

    fn connector(table: &str) -> SqlConnector<RecordingBackend> {
        SqlConnector::new(
            "ansi",
            RecordingBackend::default(),
            TableRef::new(None, table),
            PoolSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_field_info_is_described_once() {
        let connector = connector("towns");
        connector.field_info().await.unwrap();
        connector.field_info().await.unwrap();
        assert_eq!(connector.backend().describes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_table_is_schema_error() {
        let err = connector("nowhere").field_info().await.unwrap_err();
        assert!(matches!(err, DataError::SchemaError(_)));
    }

    #[tokio::test]
    async fn test_allowlist_includes_known_safe() {
        let functions = connector("towns").function_allowlist().await.unwrap();
        assert!(functions.contains("upper"));
        assert!(functions.contains("count"));
        assert!(!functions.contains("pg_sleep"));
    }

    #[tokio::test]
    async fn test_perform_select_runs_compiled_statement() {
        let connector = connector("towns");
        let fields = connector.field_info().await.unwrap();
        let functions = connector.function_allowlist().await.unwrap();
        let scope = FieldScope::new(&fields, &functions, connector.capabilities());
        let query = SelectQuery::from_params(
            &QueryParams::new()
                .with("town", "BOSTON")
                .with("clientid", "a"),
            &scope,
            50,
        )
        .unwrap();

        let result = connector.perform_select(&query).await.unwrap();
        assert_eq!(result.datacount, 1);
        assert_eq!(result.column_names(), vec!["town", "pop2010"]);

        let statements = connector.backend().statements.lock().unwrap();
        assert_eq!(
            statements[0].sql,
            r#"SELECT "town", "pop2010" FROM "towns" WHERE ("town" = ?) LIMIT 50"#
        );
        assert_eq!(connector.pool().len(), 1);
    }

    #[tokio::test]
    async fn test_table_listing() {
        let backend = RecordingBackend::default();
        let listing = list_tables(&backend, "census".into(), true).await.unwrap();
        assert_eq!(listing[0].source, "census");
        assert_eq!(listing[0].tables[0].name, "towns");
        assert_eq!(listing[0].tables[1].name, "information_schema.tables");
        assert_eq!(
            listing[0].tables[1].schema.as_deref(),
            Some("information_schema")
        );
    }
}
