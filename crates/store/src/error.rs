use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("database error: {0}")]
    Database(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("key generation error: {0}")]
    KeyGen(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<prost::EncodeError> for StoreError {
    fn from(e: prost::EncodeError) -> Self {
        StoreError::Encode(e.to_string())
    }
}
