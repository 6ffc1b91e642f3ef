use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("duplicate job id: {0}")]
    DuplicateId(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("worker manager is already running")]
    AlreadyRunning,

    #[error("worker manager is not running")]
    NotRunning,

    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Process exit code for the CLI: 1 for user-facing validation and
    /// state errors, 2 for storage and I/O failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            QueueError::DuplicateId(_)
            | QueueError::InvalidInput(_)
            | QueueError::NotFound(_)
            | QueueError::AlreadyRunning
            | QueueError::NotRunning => 1,
            QueueError::Storage(_) | QueueError::Io(_) => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
