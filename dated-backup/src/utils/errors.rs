//! Error taxonomy for backup runs.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient remote failure (connection reset, timeout, 4xx reply).
    #[error("Network error: {0}")]
    Network(String),

    /// Permanent remote failure (auth rejected, invalid path, 5xx reply).
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl BackupError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackupError::Network(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            BackupError::NotFound(_) => true,
            BackupError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
