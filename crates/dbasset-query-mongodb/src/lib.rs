//! MongoDB connector for dbasset-query
//!
//! Serves one collection as a table. Fields are inferred from a sample of
//! documents, filters compile to a BSON query document and rows come back
//! as maps keyed by column name.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dbasset_query::{ConnectionInfo, ConnectorRegistry, EngineConfig, QueryEngine, QueryParams};
//!
//! # async fn example() -> dbasset_query::Result<()> {
//! let mut registry = ConnectorRegistry::new();
//! dbasset_query_mongodb::register(&mut registry);
//! let engine = QueryEngine::new(registry, EngineConfig::default());
//!
//! let info = ConnectionInfo::new("mongodb://localhost:27017/census").with_table("towns");
//! let output = engine
//!     .query_database("towns", &info, &QueryParams::new().with("limit", 10))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod filter;
pub mod schema;

pub use filter::{compile_filters, compile_sort, json_to_bson};
pub use schema::{bson_to_json, document_to_json, infer_fields};

use async_trait::async_trait;
use bson::{doc, Document};
use dbasset_query::{
    run_cancellable, ConnectionInfo, Connector, ConnectorCapabilities, ConnectorFactory,
    ConnectorRegistry, DataError, DialectTable, Expr, FieldDescriptor, FunctionAllowList,
    OperatorId, OperatorPolicy, OutputColumn, PoolSettings, Result, Rows, SelectQuery,
    SelectResult, SessionManager, SessionPool, StatementCanceller, TableEntry, TableListing,
};
use futures::TryStreamExt;
use mongodb::{options::ClientOptions, Client, Collection};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error};

pub const CONNECTOR_TYPE: &str = "mongodb";

/// Documents read to infer the fields of a collection
const SAMPLE_SIZE: i64 = 100;

/// Driver URI for `uri`; the `mongo` dialect alias is not a driver scheme
pub fn driver_uri(uri: &str) -> String {
    match uri.strip_prefix("mongo://") {
        Some(rest) => format!("mongodb://{rest}"),
        None => uri.to_string(),
    }
}

async fn connect(uri: &str) -> Result<Client> {
    let options = ClientOptions::parse(driver_uri(uri)).await.map_err(|e| {
        error!("Failed to parse MongoDB URL: {}", e);
        DataError::ConnectionFailed(format!("Failed to parse MongoDB URL: {}", e))
    })?;
    Client::with_options(options).map_err(|e| {
        error!("Failed to create MongoDB client: {}", e);
        DataError::ConnectionFailed(format!("Failed to create MongoDB client: {}", e))
    })
}

fn query_error(e: mongodb::error::Error, what: &str) -> DataError {
    error!("MongoDB {} failed: {}", what, e);
    DataError::QueryFailed(format!("MongoDB {} failed: {}", what, e))
}

/// Hands out handles to one collection
///
/// The driver pools its own connections; a pooled session here is only the
/// unit a client id owns, so a superseded request is cancelled by dropping
/// its cursor.
pub struct CollectionSessions {
    client: Client,
    database: String,
    collection: String,
}

#[async_trait]
impl SessionManager for CollectionSessions {
    type Session = Collection<Document>;

    async fn open(&self) -> Result<Collection<Document>> {
        Ok(self
            .client
            .database(&self.database)
            .collection::<Document>(&self.collection))
    }

    async fn reset(&self, _session: &mut Collection<Document>) -> Result<()> {
        Ok(())
    }

    fn canceller(&self, _session: &Collection<Document>) -> Option<Arc<dyn StatementCanceller>> {
        None
    }
}

/// Connector serving one MongoDB collection
pub struct MongoConnector {
    pool: SessionPool<CollectionSessions>,
    fields: OnceCell<Arc<Vec<FieldDescriptor>>>,
}

impl MongoConnector {
    /// Must be called inside a tokio runtime
    pub fn new(client: Client, database: &str, collection: &str, settings: PoolSettings) -> Self {
        let sessions = CollectionSessions {
            client,
            database: database.to_string(),
            collection: collection.to_string(),
        };
        Self {
            pool: SessionPool::new(sessions, settings),
            fields: OnceCell::new(),
        }
    }

    fn collection_name(&self) -> &str {
        &self.pool.manager().collection
    }
}

/// Projection covering the selected fields; `_id` only when asked for
fn projection(columns: &[OutputColumn]) -> Result<Document> {
    let mut projection = doc! { "_id": 0 };
    for column in columns {
        match &column.expr {
            Expr::Field(name) => {
                projection.insert(name.clone(), 1);
            }
            Expr::Value(_) => {}
            Expr::Function { .. } => {
                return Err(DataError::operation_not_supported(
                    "Functions in fields are not supported by MongoDB",
                ))
            }
        }
    }
    Ok(projection)
}

/// Shape a fetched document as a row keyed by column name
fn to_row(document: &Document, columns: &[OutputColumn]) -> Map<String, Value> {
    columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            let value = match &column.expr {
                Expr::Field(name) => document
                    .get(name)
                    .map(schema::bson_to_json)
                    .unwrap_or(Value::Null),
                Expr::Value(value) => value.clone(),
                Expr::Function { .. } => Value::Null,
            };
            (column.column_name(index), value)
        })
        .collect()
}

#[async_trait]
impl Connector for MongoConnector {
    fn source_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            grouping: false,
            field_functions: false,
            sort_functions: false,
            filter_functions: false,
            operators: &OperatorId::ALL,
            operator_policy: OperatorPolicy::default(),
        }
    }

    async fn field_info(&self) -> Result<Arc<Vec<FieldDescriptor>>> {
        self.fields
            .get_or_try_init(|| async {
                let mut pooled = self.pool.acquire(None).await?;
                let collection = pooled.session()?;
                let sample: Vec<Document> = collection
                    .find(Document::new())
                    .limit(SAMPLE_SIZE)
                    .await
                    .map_err(|e| query_error(e, "sample"))?
                    .try_collect()
                    .await
                    .map_err(|e| query_error(e, "sample"))?;
                let fields = schema::infer_fields(&sample);
                if fields.is_empty() {
                    return Err(DataError::SchemaError(format!(
                        "Collection {} not found or empty",
                        self.collection_name()
                    )));
                }
                debug!(
                    "Inferred {} fields of {} from {} documents",
                    fields.len(),
                    self.collection_name(),
                    sample.len()
                );
                Ok(Arc::new(fields))
            })
            .await
            .cloned()
    }

    async fn function_allowlist(&self) -> Result<Arc<FunctionAllowList>> {
        Ok(Arc::new(FunctionAllowList::default()))
    }

    async fn perform_select(&self, query: &SelectQuery) -> Result<SelectResult> {
        if query.group.is_some() {
            return Err(DataError::GroupingUnsupported);
        }
        let filter = filter::compile_filters(&query.filters)?;
        let sort = filter::compile_sort(&query.sort)?;
        let projection = projection(&query.fields)?;

        let documents = if query.limit == Some(0) {
            Vec::new()
        } else {
            debug!("Executing find on {}: {}", self.collection_name(), filter);
            let mut pooled = self.pool.acquire(query.client_id.as_deref()).await?;
            let token = pooled.token().clone();
            let collection = pooled.session()?;
            let limit = query
                .limit
                .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX));
            let find = async {
                let cursor = collection
                    .find(filter)
                    .sort(sort)
                    .projection(projection)
                    .skip(query.offset)
                    .limit(limit.unwrap_or(0))
                    .await
                    .map_err(|e| query_error(e, "find"))?;
                cursor
                    .try_collect::<Vec<Document>>()
                    .await
                    .map_err(|e| query_error(e, "find"))
            };
            run_cancellable(&token, find).await?
        };

        debug!("Query returned {} documents", documents.len());
        let rows = documents
            .iter()
            .map(|document| to_row(document, &query.fields))
            .collect();
        Ok(SelectResult::new(
            query.limit,
            query.offset,
            query.sort.clone(),
            query.fields.clone(),
            Rows::Dict(rows),
        ))
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing MongoDB connector for {}", self.collection_name());
        self.pool.close_all();
        Ok(())
    }
}

/// Factory for [`MongoConnector`]
#[derive(Default)]
pub struct MongoFactory;

impl MongoFactory {
    fn database(info: &ConnectionInfo) -> Result<String> {
        info.database_name().ok_or_else(|| {
            DataError::invalid_configuration("A MongoDB database name is required")
        })
    }

    fn collection(info: &ConnectionInfo) -> Result<&str> {
        match info.collection.as_deref().filter(|name| !name.is_empty()) {
            Some(collection) => Ok(collection),
            None => info.require_table(),
        }
    }
}

#[async_trait]
impl ConnectorFactory for MongoFactory {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn dialects(&self) -> DialectTable {
        DialectTable::new(0)
            .with_dialect("mongodb", CONNECTOR_TYPE)
            .with_dialect("mongo", CONNECTOR_TYPE)
            .with_default(CONNECTOR_TYPE)
    }

    fn validate(&self, info: &ConnectionInfo) -> Result<()> {
        Self::collection(info)?;
        Self::database(info)?;
        Ok(())
    }

    async fn create(
        &self,
        info: &ConnectionInfo,
        _dialect: &str,
        pool: PoolSettings,
    ) -> Result<Arc<dyn Connector>> {
        let database = Self::database(info)?;
        let collection = Self::collection(info)?;
        let client = connect(&info.uri).await?;
        Ok(Arc::new(MongoConnector::new(
            client,
            &database,
            collection,
            pool,
        )))
    }

    async fn table_list(
        &self,
        info: &ConnectionInfo,
        _dialect: &str,
        include_internal: bool,
    ) -> Result<Vec<TableListing>> {
        let client = connect(&info.uri).await?;
        let databases = match info.database_name() {
            Some(database) => vec![database],
            None => client
                .list_database_names()
                .await
                .map_err(|e| query_error(e, "database listing"))?,
        };

        let mut listings = Vec::with_capacity(databases.len());
        for database in databases {
            let mut names = client
                .database(&database)
                .list_collection_names()
                .await
                .map_err(|e| query_error(e, "collection listing"))?;
            names.sort();
            let tables = names
                .into_iter()
                .filter(|name| include_internal || !name.starts_with("system."))
                .map(|name| TableEntry {
                    name: name.clone(),
                    native_name: name,
                    schema: None,
                })
                .collect();
            listings.push(TableListing {
                source: database,
                tables,
            });
        }
        Ok(listings)
    }
}

/// Register the MongoDB connector
pub fn register(registry: &mut ConnectorRegistry) {
    registry.register(Arc::new(MongoFactory));
}
