use crate::cache::ConnectorCache;
use crate::canonical::FieldScope;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::format::{format_result, FormattedOutput, OutputFormat};
use crate::params::QueryParams;
use crate::poll::perform_select_with_polling;
use crate::query::SelectQuery;
use crate::registry::{ConnectionInfo, ConnectorRegistry};
use crate::traits::Connector;
use crate::types::{FieldDescriptor, TableListing};
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point for hosts: resolves, caches and queries connectors
pub struct QueryEngine {
    registry: ConnectorRegistry,
    cache: ConnectorCache,
    config: EngineConfig,
}

impl QueryEngine {
    pub fn new(registry: ConnectorRegistry, config: EngineConfig) -> Self {
        Self {
            registry,
            cache: ConnectorCache::new(config.connector_cache_size),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Cached connector for a logical source, built on first use
    pub async fn connector(
        &self,
        logical_id: &str,
        info: &ConnectionInfo,
    ) -> Result<Arc<dyn Connector>> {
        self.cache
            .get_or_build(logical_id, info, || self.build_connector(info))
            .await
    }

    async fn build_connector(&self, info: &ConnectionInfo) -> Result<Arc<dyn Connector>> {
        let resolved = self
            .registry
            .resolve(&info.uri, info.connector_type.as_deref())?;
        resolved.factory.validate(info)?;
        let pool = self.config.pool_settings(info)?;
        info!(
            "Creating {} connector ({}) for {}",
            resolved.factory.connector_type(),
            resolved.dialect,
            info.redacted_uri()
        );
        resolved.factory.create(info, &resolved.dialect, pool).await
    }

    /// Run a query against a logical source and encode the result
    ///
    /// The source's default parameters apply under `params`.
    pub async fn query_database(
        &self,
        logical_id: &str,
        info: &ConnectionInfo,
        params: &QueryParams,
    ) -> Result<FormattedOutput> {
        let params = params.merged_over(&info.default_params);
        let format = OutputFormat::parse(params.get_str("format").as_deref())?;
        let connector = self.connector(logical_id, info).await?;
        self.run_query(connector.as_ref(), &params, format).await
    }

    /// Run a query against an already constructed connector
    pub async fn query_connector(
        &self,
        connector: &dyn Connector,
        params: &QueryParams,
    ) -> Result<FormattedOutput> {
        let format = OutputFormat::parse(params.get_str("format").as_deref())?;
        self.run_query(connector, params, format).await
    }

    async fn run_query(
        &self,
        connector: &dyn Connector,
        params: &QueryParams,
        format: OutputFormat,
    ) -> Result<FormattedOutput> {
        let fields = connector.field_info().await?;
        let functions = connector.function_allowlist().await?;
        let scope = FieldScope::new(&fields, &functions, connector.capabilities());
        let query = SelectQuery::from_params(params, &scope, self.config.default_limit)?;
        debug!(
            "Running {} select: {} filters, limit {:?}, offset {}",
            connector.source_type(),
            query.filters.len(),
            query.limit,
            query.offset
        );
        let result = perform_select_with_polling(connector, &query).await?;
        Ok(format_result(result, format, params.get_bool("pretty")))
    }

    pub async fn field_info(
        &self,
        logical_id: &str,
        info: &ConnectionInfo,
    ) -> Result<Arc<Vec<FieldDescriptor>>> {
        self.connector(logical_id, info).await?.field_info().await
    }

    /// Drop the cached connector of a source; returns whether one existed
    pub async fn invalidate(&self, logical_id: &str) -> bool {
        self.cache.invalidate(logical_id).await
    }

    /// Tables reachable through a connection, without caching a connector
    pub async fn list_tables(
        &self,
        info: &ConnectionInfo,
        include_internal: bool,
    ) -> Result<Vec<TableListing>> {
        let resolved = self
            .registry
            .resolve(&info.uri, info.connector_type.as_deref())?;
        resolved
            .factory
            .table_list(info, &resolved.dialect, include_internal)
            .await
    }

    /// Close every cached connector
    pub async fn shutdown(&self) {
        self.cache.clear().await;
    }
}
