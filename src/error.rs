//! Error types for scheduler operations

use thiserror::Error;

/// Scheduler operation result type
pub type Result<T> = std::result::Result<T, SchedError>;

/// Scheduler operation errors
#[derive(Error, Debug)]
pub enum SchedError {
    /// Configuration rejected at load time
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive set is not configured
    #[error("Unknown archive set: {0}")]
    UnknownArchSet(String),

    /// Filesystem is not configured
    #[error("Unknown filesystem: {0}")]
    UnknownFileSystem(String),

    /// No queued or active request with this name
    #[error("Unknown archive request: {0}")]
    UnknownRequest(String),

    /// Instance name did not parse as fs.set.seq.copy
    #[error("Malformed instance name: {0}")]
    BadInstanceName(String),

    /// Copy index outside the request's drive range
    #[error("Copy instance {copy} out of range for request {request}")]
    BadCopyIndex { request: String, copy: usize },

    /// Volume overflow is not permitted for this media/file size
    #[error("Volume overflow not permitted for {0}")]
    OverflowNotAllowed(String),

    /// Copy worker could not be started
    #[error("Worker launch failed: {0}")]
    Launch(String),

    /// Operation arrived after shutdown began
    #[error("Scheduler is shut down")]
    ShutDown,
}
