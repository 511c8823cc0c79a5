use thiserror::Error;

/// Coarse classification of a [`DataError`].
///
/// Hosts use this to map failures onto their own responses: configuration and
/// validation problems are caller mistakes, backend errors come from the
/// database, and unsupported features are neither.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Backend,
    Unsupported,
    Internal,
}

/// Unified error type for all connector and query operations
#[derive(Error, Debug)]
pub enum DataError {
    /// Invalid or incomplete connection configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An explicit connector type was requested that nothing registered
    #[error("Unknown connector type: {0}")]
    UnknownConnectorType(String),

    /// The URI carries no dialect and no connector type was given
    #[error("No database dialect in the URI and no connector type specified")]
    NoDialect,

    /// The URI dialect is not handled by any registered connector
    #[error("No connector handles the database dialect: {0}")]
    UnknownDialect(String),

    /// Malformed query parameter, filter, sort or field list
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Reference to a field the connector does not know
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// Operator not permitted for the datatype of the filtered field
    #[error("Cannot use {operator} operator on field {field}")]
    OperatorNotAllowed { operator: String, field: String },

    /// Function not on the connector's allow-list
    #[error("Function {0} is not allowed")]
    FunctionNotAllowed(String),

    /// Requested output encoding is not known
    #[error("Unknown output format: {0}")]
    UnknownFormat(String),

    /// Connection failed (authentication, network, missing file, etc.)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection lost or closed unexpectedly
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Query execution failed on the backend
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema/introspection error
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// The running statement was cancelled because a newer request superseded it
    #[error("Query cancelled")]
    Cancelled,

    /// A group clause was supplied to a connector that cannot group
    #[error("Group unsupported by this database")]
    GroupingUnsupported,

    /// Operation not supported by this backend
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DataError::InvalidConfiguration(_)
            | DataError::UnknownConnectorType(_)
            | DataError::NoDialect
            | DataError::UnknownDialect(_) => ErrorKind::Configuration,
            DataError::InvalidQuery(_)
            | DataError::UnknownField(_)
            | DataError::OperatorNotAllowed { .. }
            | DataError::FunctionNotAllowed(_)
            | DataError::UnknownFormat(_) => ErrorKind::Validation,
            DataError::ConnectionFailed(_)
            | DataError::ConnectionLost(_)
            | DataError::QueryFailed(_)
            | DataError::SchemaError(_)
            | DataError::Cancelled => ErrorKind::Backend,
            DataError::GroupingUnsupported | DataError::OperationNotSupported(_) => {
                ErrorKind::Unsupported
            }
            DataError::SerializationError(_) | DataError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Create an invalid query error with custom message
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        DataError::InvalidQuery(msg.into())
    }

    /// Create an operation not supported error
    pub fn operation_not_supported(msg: impl Into<String>) -> Self {
        DataError::OperationNotSupported(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        DataError::InvalidConfiguration(msg.into())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(e: serde_json::Error) -> Self {
        DataError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
