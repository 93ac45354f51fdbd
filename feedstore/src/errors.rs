use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite operation failed: {0}")]
    SQLite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to persist snapshot: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Schema mismatch on table '{table}': expected key attribute '{expected}', found '{found}'")]
    SchemaMismatch {
        table: String,
        expected: String,
        found: String,
    },

    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Baseline publish failed: {0}")]
    Publish(String),
}

impl StorageError {
    /// Whether the operation that produced this error may be retried as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Transient(_) => true,
            StorageError::SQLite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
