//! Error types for diskuze-state

use thiserror::Error;

/// Errors that can occur in the storage layer.
///
/// `Clone` so a single failed batch fetch can be reported to every caller
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Database connection error
    #[error("database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("database query failed: {0}")]
    Query(String),

    /// Foreign key or unique constraint violated
    #[error("constraint violated on {table}: {detail}")]
    Constraint { table: String, detail: String },

    /// Transaction lost a write-write race
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// Row could not be (de)serialized
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Operation issued after commit or rollback
    #[error("transaction already closed")]
    TransactionClosed,

    /// Schema setup error
    #[error("schema setup failed: {0}")]
    SchemaSetup(String),
}

impl StorageError {
    pub fn constraint(table: impl Into<String>, detail: impl Into<String>) -> Self {
        StorageError::Constraint {
            table: table.into(),
            detail: detail.into(),
        }
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        let message = err.to_string();
        // THROW statements from the commit query carry this marker
        if message.contains("referential integrity") {
            return StorageError::constraint("comment", message);
        }
        if message.contains("already contains") {
            return StorageError::Conflict(message);
        }
        StorageError::Query(message)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
