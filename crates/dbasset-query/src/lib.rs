//! # dbasset-query
//!
//! Core of a read-only query engine that exposes database tables and
//! collections as queryable virtual files.
//!
//! ## Architecture
//!
//! - **Canonicalizer** ([`canonical`]): turns loosely-typed request
//!   parameters into the strict AST in [`ast`], checking fields, functions
//!   and operators against the connector
//! - **Registry** ([`ConnectorRegistry`]): maps connector type names and URI
//!   dialects to [`ConnectorFactory`] implementations
//! - **Connectors** ([`Connector`]): compile the AST to a native query and run
//!   it, backend crates provide the implementations
//! - **Session pool** ([`SessionPool`]): per-client backend sessions with
//!   cancel-on-supersede and idle/abandon reaping
//! - **Poller** ([`perform_select_with_polling`]): repeats empty selects
//!   within a wait budget
//! - **Formatter** ([`format_result`]): list, dict, csv, json, jsonlines,
//!   geojson and raw encodings as lazy byte streams
//! - **Cache** ([`ConnectorCache`]): connector instances by logical source
//!
//! [`QueryEngine`] ties these together for hosts.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dbasset_query::{ConnectionInfo, ConnectorRegistry, EngineConfig, QueryEngine, QueryParams};
//!
//! # async fn example() -> dbasset_query::Result<()> {
//! let registry = ConnectorRegistry::new();
//! // backend crates register their factories here
//! let engine = QueryEngine::new(registry, EngineConfig::from_env());
//!
//! let info = ConnectionInfo::new("sqlite:///data/towns.db").with_table("towns");
//! let params = QueryParams::new()
//!     .with("filters", r#"[["town", "BOSTON"]]"#)
//!     .with("format", "csv");
//! let output = engine.query_database("towns", &info, &params).await?;
//! # let _ = output;
//! # Ok(())
//! # }
//! ```

pub mod ast;
pub mod cache;
pub mod canonical;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod params;
pub mod poll;
pub mod pool;
pub mod query;
pub mod registry;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use ast::{
    Combinator, Expr, Filter, FilterLeaf, FilterValue, OperatorId, OutputColumn, SortDirection,
    SortKey,
};
pub use cache::ConnectorCache;
pub use canonical::{FieldScope, FunctionUse};
pub use config::{EngineConfig, PoolSettings};
pub use engine::QueryEngine;
pub use error::{DataError, ErrorKind, Result};
pub use format::{format_result, ByteStream, FormattedOutput, OutputFormat, StreamFactory};
pub use params::QueryParams;
pub use poll::perform_select_with_polling;
pub use pool::{
    run_cancellable, PooledSession, SessionManager, SessionPool, SessionState, StatementCanceller,
};
pub use query::SelectQuery;
pub use registry::{ConnectionInfo, ConnectorRegistry, DialectTable, ResolvedConnector};
pub use traits::{Connector, ConnectorFactory};
pub use types::{
    ConnectorCapabilities, Datatype, FieldDescriptor, FunctionAllowList, OperatorPolicy,
    RowFormat, Rows, SelectResult, TableEntry, TableListing, KNOWN_SAFE_FUNCTIONS,
};
