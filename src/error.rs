//! Error types for the synchronization engine.

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State not managed: {0}")]
    StateNotManaged(String),

    #[error("Object store not found: {0}")]
    ObjectStoreNotFound(String),

    #[error("Record in {store} has no usable key field '{key_field}'")]
    MissingKey { store: String, key_field: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid database format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Schema mismatch in {store}: expected key path {expected}, found {found}")]
    SchemaMismatch {
        store: String,
        expected: String,
        found: String,
    },

    #[error("Database is locked by another process")]
    Locked,

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

impl SyncError {
    /// Whether the error means the on-disk structure cannot be trusted.
    ///
    /// The local database recovers from these by dropping and recreating.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidFormat(_)
                | SyncError::Corruption(_)
                | SyncError::ChecksumMismatch { .. }
                | SyncError::SchemaMismatch { .. }
                | SyncError::Deserialization(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
