use thiserror::Error;

/// Errors that can occur within the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A payload or flag set could not be (de)serialised.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The blocking worker thread running a store call panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A task identifier could not be resolved to a task id.
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// The enqueue request is malformed (empty task, max_attempts < 1, ...).
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
