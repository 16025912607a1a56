use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("send error: {0}")]
    Send(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
