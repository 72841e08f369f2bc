use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("storage failed: {0}")]
    Storage(String),
    #[error("intake channel closed")]
    IntakeClosed,
    #[error("worker pool unavailable: {0}")]
    Pool(String),
}
