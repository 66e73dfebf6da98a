use thiserror::Error;

#[derive(Error, Debug)]
pub enum CuratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Similarity index error: {0}")]
    Index(String),

    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Oracle response violates contract: {0}")]
    Contract(String),

    #[error("Graph rebuild failed: {0}")]
    Graph(String),

    #[error("Run state error: {0}")]
    State(String),

    #[error("Run state is stale (checksum {found} does not match recorded {expected}); pass --yes to discard it")]
    StaleState { expected: String, found: String },

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: crate::types::RecordStatus,
        to: crate::types::RecordStatus,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CuratorError>;
