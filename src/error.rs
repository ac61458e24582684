//! Error types for the cytoprofile library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("missing column '{0}'")]
    MissingColumn(String),

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("invalid feature value '{value}' in column '{column}' at row {row}")]
    InvalidValue {
        column: String,
        value: String,
        row: usize,
    },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("identity mismatch: '{expected}' not found in '{found}'")]
    IdentityMismatch { expected: String, found: String },

    #[error("plate barcode '{0}' not present in barcode platemap file")]
    UnknownBarcode(String),

    #[error("annotation join incomplete: {unmatched} of {total} profile rows have no platemap entry")]
    IncompleteJoin { unmatched: usize, total: usize },

    #[error("empty data: {0}")]
    EmptyData(String),

    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, ProfileError>;
