//! Relational layer for dbasset-query
//!
//! Compiles the canonical AST into parameterized SQL through a
//! [`SqlDialect`], and runs it through a [`SqlBackend`] wrapped in a
//! [`SqlConnector`]. Backend crates supply the dialect and the driver; the
//! [`generic`] module is a ready-made backend on the `sqlx` Any driver.

pub mod backend;
pub mod compiler;
pub mod dialect;
pub mod generic;

pub use backend::{is_internal_schema, list_tables, table_entry, SqlBackend, SqlConnector};
pub use compiler::{is_type_name, CompiledQuery, SqlCompiler, TableRef};
pub use dialect::{classify_native_type, MatchSyntax, SqlDialect, SqlParam, ANSI_OPERATORS};
pub use generic::{driver_uri, sqlite_path, GenericBackend, GenericDialect, GenericSqlFactory};

use dbasset_query::ConnectorRegistry;
use std::sync::Arc;

/// Register the generic connector under the `sql` type
pub fn register(registry: &mut ConnectorRegistry) {
    registry.register(Arc::new(GenericSqlFactory::new()));
}
