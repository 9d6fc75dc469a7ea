//! On-disk collection of generations.
//!
//! Layout: `backup_root/<YYYY-MM-DD>/…` mirrors the source tree verbatim.
//! A generation is copied into a hidden `.<id>.partial` sibling and only
//! renamed to its final name once every file is in place, so a listing
//! never shows a half-written generation.

use super::{CollisionPolicy, Generation, GenerationId, Leftover, SnapshotStore};
use crate::fs::metadata::copy_preserving;
use crate::fs::walker::{walk_tree, EntryKind, WalkOptions};
use crate::transfer::progress::format_bytes;
use crate::transfer::{TransferStats, TransferTimer};
use crate::utils::errors::{BackupError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct LocalSnapshotStore {
    root: PathBuf,
    walk_options: WalkOptions,
}

impl LocalSnapshotStore {
    pub fn new(root: impl Into<PathBuf>, walk_options: WalkOptions) -> Self {
        Self {
            root: root.into(),
            walk_options,
        }
    }

    pub fn location(&self, id: GenerationId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn staging_location(&self, id: GenerationId) -> PathBuf {
        self.root.join(id.staging_name())
    }

    fn create_with<F>(
        &self,
        source: &Path,
        id: GenerationId,
        policy: CollisionPolicy,
        cancel: &CancellationToken,
        copy_file: F,
    ) -> Result<Generation>
    where
        F: FnMut(&Path, &Path) -> std::io::Result<u64>,
    {
        let final_path = self.location(id);
        if final_path.exists() && policy == CollisionPolicy::Fail {
            return Err(BackupError::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("generation {} already exists at {}", id, final_path.display()),
            )));
        }

        fs::create_dir_all(&self.root)?;

        let staging = self.staging_location(id);
        if staging.exists() {
            warn!(path = %staging.display(), "Removing stale staging directory from an interrupted run");
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir(&staging)?;

        let timer = TransferTimer::start();
        let stats = match self.copy_tree(source, &staging, cancel, copy_file) {
            Ok(stats) => stats,
            Err(e) => {
                discard(&staging);
                return Err(e);
            }
        };

        let replaced = self.root.join(id.replaced_name());
        if let Err(e) = publish(&staging, &final_path, &replaced) {
            discard(&staging);
            return Err(e.into());
        }

        info!(
            generation = %id,
            files = stats.files,
            directories = stats.directories,
            size = %format_bytes(stats.bytes),
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "Local generation created"
        );

        Ok(Generation {
            id,
            location: final_path,
        })
    }

    fn copy_tree<F>(
        &self,
        source: &Path,
        dest: &Path,
        cancel: &CancellationToken,
        mut copy_file: F,
    ) -> Result<TransferStats>
    where
        F: FnMut(&Path, &Path) -> std::io::Result<u64>,
    {
        if !fs::metadata(source)?.is_dir() {
            return Err(BackupError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("source {} is not a directory", source.display()),
            )));
        }

        let entries = walk_tree(source, &self.walk_options)?;
        let mut stats = TransferStats::default();

        for entry in entries {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            let target = dest.join(&entry.relative_path);
            match entry.kind {
                EntryKind::Directory => {
                    fs::create_dir(&target)?;
                    stats.record_directory();
                }
                EntryKind::File => {
                    let bytes = copy_file(&entry.path, &target).map_err(|e| {
                        BackupError::Io(std::io::Error::new(
                            e.kind(),
                            format!("copying {}: {}", entry.path.display(), e),
                        ))
                    })?;
                    debug!(file = %entry.relative_path.display(), bytes, "Copied");
                    stats.record_file(bytes);
                }
            }
        }

        Ok(stats)
    }
}

impl SnapshotStore for LocalSnapshotStore {
    /// Copy `source` into a new generation named `id`.
    ///
    /// On any failure (unreadable source, collision under
    /// [`CollisionPolicy::Fail`], a copy error, cancellation) nothing is left
    /// under the backup root for this id.
    fn create(
        &self,
        source: &Path,
        id: GenerationId,
        policy: CollisionPolicy,
        cancel: &CancellationToken,
    ) -> Result<Generation> {
        self.create_with(source, id, policy, cancel, copy_preserving)
    }

    /// All generations, oldest first. Entries that are not generations
    /// (stray files, staging directories) are skipped.
    fn list(&self) -> Result<Vec<Generation>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut generations = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            if !entry.file_type()?.is_dir() {
                debug!(name = %name, "Skipping non-directory in backup root");
                continue;
            }

            match GenerationId::parse(&name) {
                Some(id) => generations.push(Generation {
                    id,
                    location: entry.path(),
                }),
                None if name.starts_with('.') => {
                    debug!(name = %name, "Skipping hidden directory in backup root");
                }
                None => {
                    warn!(name = %name, "Skipping folder, not a valid generation name");
                }
            }
        }

        generations.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(generations)
    }

    /// Remove a generation and everything below it
    fn delete(&self, id: GenerationId) -> Result<()> {
        let path = self.location(id);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(BackupError::NotFound(format!(
                    "{} is not a generation directory",
                    path.display()
                )))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        fs::remove_dir_all(&path)?;
        info!(generation = %id, path = %path.display(), "Deleted local generation");
        Ok(())
    }

    fn leftovers(&self) -> Result<Vec<Leftover>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut leftovers = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(leftover) = Leftover::parse(&entry.file_name().to_string_lossy()) {
                leftovers.push(leftover);
            }
        }

        leftovers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(leftovers)
    }

    fn remove_leftover(&self, leftover: &Leftover) -> Result<()> {
        let path = self.root.join(&leftover.name);
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Removed leftover from an interrupted run");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BackupError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Move a finished staging tree into place, replacing an existing
/// generation only after the new one is complete. The old generation is
/// parked at `replaced` until the swap is done.
fn publish(staging: &Path, final_path: &Path, replaced: &Path) -> std::io::Result<()> {
    if !final_path.exists() {
        return fs::rename(staging, final_path);
    }

    if replaced.exists() {
        fs::remove_dir_all(replaced)?;
    }

    fs::rename(final_path, replaced)?;
    if let Err(e) = fs::rename(staging, final_path) {
        // Put the old generation back
        if let Err(restore) = fs::rename(replaced, final_path) {
            warn!(
                parked = %replaced.display(),
                generation = %final_path.display(),
                error = %restore,
                "Failed to restore replaced generation"
            );
        }
        return Err(e);
    }
    if let Err(e) = fs::remove_dir_all(replaced) {
        warn!(path = %replaced.display(), error = %e, "Failed to remove replaced generation");
    }
    Ok(())
}

fn discard(staging: &Path) {
    if let Err(e) = fs::remove_dir_all(staging) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %staging.display(), error = %e, "Failed to remove partial generation");
        }
    }
}
