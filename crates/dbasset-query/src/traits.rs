use crate::config::PoolSettings;
use crate::error::Result;
use crate::query::SelectQuery;
use crate::registry::{ConnectionInfo, DialectTable};
use crate::types::*;
use async_trait::async_trait;
use downcast_rs::{impl_downcast, Downcast};
use std::sync::Arc;

/// Core trait that every connector instance implements
///
/// One instance serves one logical data source (a table or collection).
/// Field info and the function allow-list are introspected once and cached
/// by the implementation.
#[async_trait]
pub trait Connector: Send + Sync + Downcast {
    /// Registered type name of this connector
    fn source_type(&self) -> &'static str;

    /// Features the canonicalizer checks requests against
    fn capabilities(&self) -> ConnectorCapabilities;

    /// Fields of the data source, computed on first use
    async fn field_info(&self) -> Result<Arc<Vec<FieldDescriptor>>>;

    /// Functions this connector will compile
    async fn function_allowlist(&self) -> Result<Arc<FunctionAllowList>>;

    /// Compile and run a canonical select
    ///
    /// Runs on the pooled session of `query.client_id` when one is given, so
    /// a later request for the same client cancels this one.
    async fn perform_select(&self, query: &SelectQuery) -> Result<SelectResult>;

    /// Close pooled sessions and stop background work
    async fn close(&self) -> Result<()>;
}

impl_downcast!(Connector);

/// Factory for creating connector instances
///
/// Registered once per backend type in the [`crate::ConnectorRegistry`].
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// The type name this factory registers under (e.g. "postgresql", "mongodb")
    fn connector_type(&self) -> &'static str;

    /// URI dialects this connector accepts and its resolution priority
    fn dialects(&self) -> DialectTable;

    /// Check connection info without contacting the backend
    fn validate(&self, info: &ConnectionInfo) -> Result<()>;

    /// Create a connector for one data source
    async fn create(
        &self,
        info: &ConnectionInfo,
        dialect: &str,
        pool: PoolSettings,
    ) -> Result<Arc<dyn Connector>>;

    /// List the tables reachable through `info.uri`
    async fn table_list(
        &self,
        info: &ConnectionInfo,
        dialect: &str,
        include_internal: bool,
    ) -> Result<Vec<TableListing>>;
}
