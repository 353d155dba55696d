use thiserror::Error;

#[derive(Error, Debug)]
pub enum DroverError {
    /// Connect failure, timeout, partial read, or decode error. The
    /// cause is deliberately collapsed: callers only learn that this
    /// worker could not be probed for this one operation.
    #[error("Worker unreachable: {0}")]
    Unreachable(String),

    #[error("Process not found: {0}")]
    NotFound(u32),

    #[error("Permission denied terminating process {0}")]
    PermissionDenied(u32),

    #[error("{0} is a critical system process and will not be terminated")]
    CriticalProcessProtected(String),

    #[error("Cancelled by operator")]
    Cancelled,

    #[error("No workers available")]
    NoWorkersAvailable,

    #[error("Worker not found in registry: {0}")]
    UnknownWorker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DroverError>;
