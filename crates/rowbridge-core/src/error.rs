use thiserror::Error;
use uuid::Uuid;

use crate::coercion::CoercionError;

#[derive(Error, Debug)]
pub enum PortError {
    #[error("cannot connect: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("bulk load into '{table}' failed: {message}")]
    Load { table: String, message: String },

    #[error("{operation} timed out after {seconds} seconds")]
    Timeout { operation: &'static str, seconds: u64 },

    #[error("column '{column}' holds a {native_type} value that cannot be read")]
    UnsupportedValue { column: String, native_type: String },

    #[error("value for column '{column}' rejected: {source}")]
    Conform {
        column: String,
        #[source]
        source: CoercionError,
    },

    #[cfg(feature = "runtime")]
    #[error("postgres: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[cfg(feature = "runtime")]
    #[error("sql server: {0}")]
    Tiberius(#[from] tiberius::error::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("mapping with ID {0} not found")]
    NotFound(Uuid),

    #[error("invalid stored value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("mapping store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("default value for target field '{field}' is invalid: {source}")]
    Default {
        field: String,
        #[source]
        source: CoercionError,
    },
}

/// Failures after validation passed; each becomes a failed `MappingResult`.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("extracting source rows failed: {0}")]
    Extract(#[source] PortError),

    #[error("{0}")]
    Transform(#[from] TransformError),

    #[error("loading target rows failed: {0}")]
    Load(#[source] PortError),

    #[error("loading target rows failed after the target table was truncated: {0}")]
    LoadAfterTruncate(#[source] PortError),
}
