use thiserror::Error;

#[derive(Debug, Error)]
pub enum NileDbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer pool exhausted: {0}")]
    FullPool(String),

    #[error("page not found: {0}")]
    PageNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

pub type Result<T> = std::result::Result<T, NileDbError>;
