use granite::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid column {0:?}, expected name:type")]
    InvalidColumn(String),
    #[error("{0}")]
    InvalidArguments(String),
}
