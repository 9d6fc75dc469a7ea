//! Transport onto a mounted filesystem (NAS share, USB disk, sshfs).
//!
//! Remote paths are resolved below the mount point. I/O failures on the
//! mount are reported as network errors, since on a network share a hiccup
//! is usually transient; permission problems are permanent.

use super::RemoteTransport;
use crate::utils::errors::{BackupError, Result};
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub struct DirectoryTransport {
    mount: PathBuf,
}

impl DirectoryTransport {
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self { mount: mount.into() }
    }

    /// Map a remote path onto the mount, refusing anything that escapes it
    fn resolve(&self, remote: &str) -> Result<PathBuf> {
        let relative = Path::new(remote.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BackupError::Protocol(format!("invalid remote path {:?}", remote)));
        }
        Ok(self.mount.join(relative))
    }
}

fn remote_error(context: &str, path: &Path, err: io::Error) -> BackupError {
    let message = format!("{} {}: {}", context, path.display(), err);
    match err.kind() {
        ErrorKind::NotFound => BackupError::NotFound(message),
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::AlreadyExists => {
            BackupError::Protocol(message)
        }
        _ => BackupError::Network(message),
    }
}

impl RemoteTransport for DirectoryTransport {
    fn endpoint(&self) -> String {
        format!("file://{}", self.mount.display())
    }

    fn ensure_directory(&mut self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        fs::create_dir_all(&target).map_err(|e| remote_error("creating", &target, e))
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let target = self.resolve(remote)?;
        let mut src = File::open(local)?;
        let mut dst = File::create(&target).map_err(|e| remote_error("creating", &target, e))?;
        io::copy(&mut src, &mut dst).map_err(|e| remote_error("writing", &target, e))
    }

    fn list_all(&mut self, path: &str) -> Result<Vec<String>> {
        let target = self.resolve(path)?;
        let read_dir = fs::read_dir(&target).map_err(|e| remote_error("listing", &target, e))?;

        let mut names = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| remote_error("listing", &target, e))?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn delete_tree(&mut self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        let meta = fs::symlink_metadata(&target).map_err(|e| remote_error("deleting", &target, e))?;
        if !meta.is_dir() {
            return Err(BackupError::NotFound(format!("{} is not a directory", target.display())));
        }
        fs::remove_dir_all(&target).map_err(|e| remote_error("deleting", &target, e))?;
        debug!(path, "Deleted remote directory");
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let (src, dst) = (self.resolve(from)?, self.resolve(to)?);
        fs::rename(&src, &dst).map_err(|e| remote_error("renaming", &src, e))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
