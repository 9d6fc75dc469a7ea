//! Dated Backup Library
//!
//! Snapshots a directory into dated generations, ships each generation to a
//! remote store and prunes generations past the retention window on both
//! ends.

pub mod config;
pub mod daemon;
pub mod fs;
pub mod orchestrator;
pub mod remote;
pub mod retention;
pub mod snapshot;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::BackupOrchestrator;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
