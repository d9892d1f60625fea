use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Executor rejected task: {0}")]
    ExecutorRejected(String),

    #[error("Capacity overflow: {0}")]
    CapacityOverflow(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Concurrent operation error: {0}")]
    Concurrent(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
