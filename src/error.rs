use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LasermarkError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to {action} {}: {source}", .path.display())]
    File {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record in {}: {detail}", .path.display())]
    MalformedRecord { path: PathBuf, detail: String },

    #[error("Start rejected: {0}")]
    StartRejected(#[from] StartRejection),

    #[error("A batch of {pending} items is already committed for the active run")]
    QueueBusy { pending: usize },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Autofocus is unavailable while a run is active")]
    AutofocusBusy,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LasermarkError {
    /// Wraps an I/O error with the file and the operation that failed.
    pub fn file(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LasermarkError::File {
            action,
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, LasermarkError>;

/// Why a start request was refused. Each reason is distinct so the operator
/// can act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartRejection {
    #[error("an engraving batch is already running")]
    AlreadyRunning,

    #[error("the door interlock is open")]
    InterlockOpen,

    #[error("no job is selected")]
    NoJobSelected,

    #[error("nothing is queued for engraving")]
    EmptyBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("jobs `{first}` and `{second}` share select pattern `{pattern}`")]
    DuplicatePattern {
        pattern: String,
        first: String,
        second: String,
    },

    #[error("job key `{0}` is defined more than once")]
    DuplicateJobKey(String),

    #[error("job `{key}` has select pattern `{pattern}`, expected {expected} characters of 0/1")]
    InvalidPattern {
        key: String,
        pattern: String,
        expected: usize,
    },

    #[error("job `{0}` uses the all-zero pattern, which means \"no job selected\"")]
    ZeroPattern(String),

    #[error("job `{0}` has an empty part number")]
    EmptyPartNumber(String),

    #[error("input {index} is out of range for {count} inputs")]
    InputOutOfRange { index: usize, count: usize },

    #[error("interlock input {0} is also configured as a job sensor")]
    InterlockIsJobInput(usize),

    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
}
