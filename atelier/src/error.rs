use thiserror::Error;

/// Errors raised by the thread store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Review not found: {0}")]
    ReviewNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// Errors raised by live thread sources.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request rejected by server: {0}")]
    Rejected(String),

    #[error("Feed closed")]
    Closed,
}
