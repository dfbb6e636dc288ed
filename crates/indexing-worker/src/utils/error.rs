use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Pair not found: {0}")]
    PairNotFound(i32),

    #[error("Attempt not found: {0}")]
    AttemptNotFound(i32),

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Indexing cancelled by stop signal")]
    Cancelled,

    #[error("Lease lost mid-attempt: {0}")]
    LeaseLost(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Connector error: {0}")]
    Connector(String),
}
