//! Remote storage endpoints.
//!
//! [`RemoteTransport`] is the seam between the pipeline and whatever holds
//! the off-site copy. Calls are blocking; the orchestrator runs them on the
//! blocking pool through [`with_remote`], one at a time, because a run owns
//! a single session.
//!
//! Remote paths are absolute, `/`-separated strings regardless of the host
//! platform.

pub mod directory;
pub mod ftp;

use crate::config::RemoteConfig;
use crate::fs::walker::{walk_tree, WalkOptions};
use crate::transfer::TransferStats;
use crate::utils::errors::{BackupError, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Span};

pub use directory::DirectoryTransport;
pub use ftp::FtpTransport;

pub trait RemoteTransport: Send {
    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;

    /// Create `path` and any missing ancestors; no-op when present
    fn ensure_directory(&mut self, path: &str) -> Result<()>;

    /// Upload one local file to `remote`, replacing it. Returns bytes sent.
    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<u64>;

    /// Every entry name directly below `path`, hidden ones included, sorted
    fn list_all(&mut self, path: &str) -> Result<Vec<String>>;

    /// Entry names directly below `path`, sorted, hidden entries dropped
    fn list_directory(&mut self, path: &str) -> Result<Vec<String>> {
        let mut names = self.list_all(path)?;
        names.retain(|name| !name.starts_with('.'));
        Ok(names)
    }

    /// Remove a directory and everything below it.
    /// Fails with [`BackupError::NotFound`] if `path` does not exist.
    fn delete_tree(&mut self, path: &str) -> Result<()>;

    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    /// End the session. Safe to call more than once.
    fn close(&mut self) -> Result<()>;

    /// Upload a local tree below `remote`.
    ///
    /// Entries go out depth-first with each directory ensured before any
    /// file inside it. The first failure aborts the walk; callers retry the
    /// whole tree.
    fn upload_tree(
        &mut self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferStats> {
        let entries = walk_tree(local, &WalkOptions::default())?;
        self.ensure_directory(remote)?;

        let mut stats = TransferStats::default();
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            let target = join_remote(remote, &entry.relative_slash_path());
            if entry.is_dir() {
                self.ensure_directory(&target)?;
                stats.record_directory();
            } else {
                let bytes = self.upload_file(&entry.path, &target)?;
                debug!(file = %target, bytes, "Uploaded");
                stats.record_file(bytes);
            }
        }

        Ok(stats)
    }
}

/// The run's single remote session, serialized behind a mutex
pub type SharedTransport = Arc<Mutex<Box<dyn RemoteTransport>>>;

pub fn shared(transport: Box<dyn RemoteTransport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

/// Build the transport named by the `[remote]` section. Does not connect.
pub fn from_config(config: &RemoteConfig) -> Box<dyn RemoteTransport> {
    match config {
        RemoteConfig::Ftp(ftp) => Box::new(FtpTransport::new(ftp.clone())),
        RemoteConfig::Directory(dir) => Box::new(DirectoryTransport::new(dir.mount.clone())),
    }
}

/// Run a blocking remote call on the blocking pool, holding the session lock
pub async fn with_remote<T, F>(remote: &SharedTransport, op: F) -> Result<T>
where
    F: FnOnce(&mut dyn RemoteTransport) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let remote = Arc::clone(remote);
    let span = Span::current();
    tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let mut guard = remote
            .lock()
            .map_err(|_| BackupError::Protocol("remote session poisoned by an earlier panic".into()))?;
        op(&mut **guard)
    })
    .await
    .map_err(|e| BackupError::Protocol(format!("remote task failed: {}", e)))?
}

/// Join a remote directory and a relative `/` path
pub fn join_remote(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return if base.is_empty() { "/".to_string() } else { base.to_string() };
    }
    format!("{}/{}", base, relative)
}

/// Parent of a remote path (`/a/b` -> `/a`, `/a` -> `/`)
pub fn parent_of(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Last segment of a listing entry; some servers answer NLST with full paths
pub fn leaf_name(entry: &str) -> &str {
    let trimmed = entry.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Split an absolute remote path into its cumulative prefixes:
/// `/a/b` -> [`/a`, `/a/b`]
pub fn ancestors(path: &str) -> Vec<String> {
    let mut current = String::new();
    path.split('/')
        .filter(|seg| !seg.is_empty())
        .map(|seg| {
            current.push('/');
            current.push_str(seg);
            current.clone()
        })
        .collect()
}

/// Directories known to exist in this session
#[derive(Debug, Default)]
pub struct DirectoryMemo {
    known: HashSet<String>,
}

impl DirectoryMemo {
    pub fn contains(&self, path: &str) -> bool {
        self.known.contains(path.trim_end_matches('/'))
    }

    pub fn insert(&mut self, path: &str) {
        self.known.insert(path.trim_end_matches('/').to_string());
    }

    /// Prefixes of `path` not yet known to exist, shallowest first
    pub fn missing(&self, path: &str) -> Vec<String> {
        ancestors(path)
            .into_iter()
            .filter(|p| !self.known.contains(p))
            .collect()
    }

    /// Forget `path` and everything below it
    pub fn forget_tree(&mut self, path: &str) {
        let path = path.trim_end_matches('/');
        let prefix = format!("{}/", path);
        self.known.retain(|p| p != path && !p.starts_with(&prefix));
    }
}
