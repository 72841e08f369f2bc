use refscope_ingest::IngestError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RefScopeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Storage corrupted at {path}: {reason}")]
    Corrupted { path: String, reason: String },
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RefScopeError> for IngestError {
    fn from(err: RefScopeError) -> Self {
        IngestError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RefScopeError>;
