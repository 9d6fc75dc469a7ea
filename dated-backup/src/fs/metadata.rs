//! File metadata handling for snapshot copies.
//!
//! A generation should look like the source did: same bytes, same mode
//! bits, same modification time. `std::fs::copy` carries the permissions;
//! timestamps are applied afterwards.

use std::fs::{self, File, FileTimes};
use std::path::Path;
use std::time::SystemTime;

/// Metadata carried over from a source file to its copy
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    pub modified: SystemTime,

    pub accessed: Option<SystemTime>,

    /// File permissions (Unix mode bits)
    pub permissions: Option<u32>,
}

impl FileMetadata {
    /// Extract metadata from a file path, following symlinks
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified()?,
            accessed: metadata.accessed().ok(),
            permissions,
        })
    }

    /// Apply the timestamps to an existing file
    pub fn apply_times(&self, path: &Path) -> std::io::Result<()> {
        let mut times = FileTimes::new().set_modified(self.modified);
        if let Some(accessed) = self.accessed {
            times = times.set_accessed(accessed);
        }
        File::options().write(true).open(path)?.set_times(times)
    }
}

/// Copy one file, keeping mode bits and timestamps. Returns bytes copied.
pub fn copy_preserving(src: &Path, dst: &Path) -> std::io::Result<u64> {
    let metadata = FileMetadata::from_path(src)?;
    let copied = fs::copy(src, dst)?;

    // Read-only sources come out read-only; open for the timestamp update first
    #[cfg(unix)]
    if let Some(mode) = metadata.permissions {
        use std::os::unix::fs::PermissionsExt;
        if mode & 0o200 == 0 {
            fs::set_permissions(dst, fs::Permissions::from_mode(mode | 0o200))?;
            metadata.apply_times(dst)?;
            fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
            return Ok(copied);
        }
    }

    metadata.apply_times(dst)?;
    Ok(copied)
}
