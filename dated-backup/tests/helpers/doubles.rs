//! Fault-injecting wrappers around the real stores.

use dated_backup::remote::{DirectoryTransport, RemoteTransport};
use dated_backup::snapshot::{
    CollisionPolicy, Generation, GenerationId, Leftover, LocalSnapshotStore, SnapshotStore,
};
use dated_backup::utils::errors::{BackupError, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connection reset, worth retrying
    Transient,
    /// Server refused, never retried
    Permanent,
}

/// Directory transport whose first `failures` file uploads fail
pub struct FlakyTransport {
    inner: DirectoryTransport,
    fault: Fault,
    failures_left: Arc<AtomicUsize>,
    /// Every `upload_file` call, failed or not
    upload_calls: Arc<AtomicUsize>,
    deleted: Arc<Mutex<Vec<String>>>,
    cancel_on_publish: Option<CancellationToken>,
}

/// Counters shared with the test after the transport is boxed away
#[derive(Clone)]
pub struct TransportCounters {
    pub upload_calls: Arc<AtomicUsize>,
    pub deleted: Arc<Mutex<Vec<String>>>,
}

impl TransportCounters {
    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// Deleted paths that were generations rather than staging leftovers
    pub fn deleted_generations(&self) -> Vec<String> {
        self.deleted
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.rsplit('/').next().unwrap_or("").starts_with('.'))
            .cloned()
            .collect()
    }
}

impl FlakyTransport {
    pub fn new(mount: &Path, fault: Fault, failures: usize) -> (Self, TransportCounters) {
        let counters = TransportCounters {
            upload_calls: Arc::new(AtomicUsize::new(0)),
            deleted: Arc::new(Mutex::new(Vec::new())),
        };
        let transport = Self {
            inner: DirectoryTransport::new(mount),
            fault,
            failures_left: Arc::new(AtomicUsize::new(failures)),
            upload_calls: Arc::clone(&counters.upload_calls),
            deleted: Arc::clone(&counters.deleted),
            cancel_on_publish: None,
        };
        (transport, counters)
    }

    /// Cancel `token` as soon as a generation is renamed into place
    pub fn cancel_on_publish(mut self, token: CancellationToken) -> Self {
        self.cancel_on_publish = Some(token);
        self
    }
}

impl RemoteTransport for FlakyTransport {
    fn endpoint(&self) -> String {
        format!("flaky+{}", self.inner.endpoint())
    }

    fn ensure_directory(&mut self, path: &str) -> Result<()> {
        self.inner.ensure_directory(path)
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<u64> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(match self.fault {
                Fault::Transient => BackupError::Network(format!("STOR {}: connection reset", remote)),
                Fault::Permanent => BackupError::Protocol(format!("STOR {}: 553 not allowed", remote)),
            });
        }
        self.inner.upload_file(local, remote)
    }

    fn list_all(&mut self, path: &str) -> Result<Vec<String>> {
        self.inner.list_all(path)
    }

    fn delete_tree(&mut self, path: &str) -> Result<()> {
        self.inner.delete_tree(path)?;
        self.deleted.lock().unwrap().push(path.to_string());
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to)?;
        if let Some(token) = &self.cancel_on_publish {
            token.cancel();
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// Local store that refuses to delete some generations
pub struct StubbornStore {
    inner: LocalSnapshotStore,
    refuse: HashSet<GenerationId>,
}

impl StubbornStore {
    pub fn new(inner: LocalSnapshotStore, refuse: &[&str]) -> Self {
        Self {
            inner,
            refuse: refuse.iter().map(|s| GenerationId::parse(s).unwrap()).collect(),
        }
    }
}

impl SnapshotStore for StubbornStore {
    fn create(
        &self,
        source: &Path,
        id: GenerationId,
        policy: CollisionPolicy,
        cancel: &CancellationToken,
    ) -> Result<Generation> {
        self.inner.create(source, id, policy, cancel)
    }

    fn list(&self) -> Result<Vec<Generation>> {
        self.inner.list()
    }

    fn delete(&self, id: GenerationId) -> Result<()> {
        if self.refuse.contains(&id) {
            return Err(BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is busy", id),
            )));
        }
        self.inner.delete(id)
    }

    fn leftovers(&self) -> Result<Vec<Leftover>> {
        self.inner.leftovers()
    }

    fn remove_leftover(&self, leftover: &Leftover) -> Result<()> {
        self.inner.remove_leftover(leftover)
    }
}
