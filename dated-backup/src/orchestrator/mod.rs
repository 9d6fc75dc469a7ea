//! Backup run orchestration.
//!
//! A run goes snapshot → upload → prune local → prune remote. Snapshot and
//! upload failures end the run before anything is deleted, so a failed run
//! always leaves the previous good generation in place on both ends. Prune
//! failures are collected per generation and only downgrade the result to
//! a success with warnings.

pub mod report;

use crate::config::Config;
use crate::fs::walker::{calculate_total_size, WalkOptions};
use crate::remote::{self, join_remote, with_remote, RemoteTransport, SharedTransport};
use crate::retention::RetentionPolicy;
use crate::snapshot::{
    CollisionPolicy, Generation, GenerationId, Leftover, LocalSnapshotStore, SnapshotStore,
};
use crate::transfer::progress::{format_bytes, format_speed};
use crate::transfer::{TransferStats, TransferTimer};
use crate::utils::errors::{BackupError, Result};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub use report::{
    exit_code, PruneFailure, PruneSummary, RunFailure, RunOutcome, RunReport, RunStatus, Stage,
};

/// What a run would do, computed without touching either store
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub generation: GenerationId,
    /// Bytes the snapshot would copy
    pub source_bytes: u64,
    pub local_expired: Vec<GenerationId>,
}

pub struct BackupOrchestrator {
    config: Config,
    local: Arc<dyn SnapshotStore>,
    remote: SharedTransport,
    retention: RetentionPolicy,
    cancel: CancellationToken,
}

impl BackupOrchestrator {
    pub fn new(
        config: Config,
        local: Arc<dyn SnapshotStore>,
        remote: Box<dyn RemoteTransport>,
        cancel: CancellationToken,
    ) -> Self {
        let retention = config.retention_policy();
        Self {
            config,
            local,
            remote: remote::shared(remote),
            retention,
            cancel,
        }
    }

    /// Wire the local store and transport described by `config`
    pub fn from_config(config: Config, cancel: CancellationToken) -> Self {
        let walk_options = WalkOptions::excluding(&config.source.exclude);
        let local = Arc::new(LocalSnapshotStore::new(
            config.local.backup_root.clone(),
            walk_options,
        ));
        let transport = remote::from_config(&config.remote);
        Self::new(config, local, transport, cancel)
    }

    pub async fn run(&self) -> RunOutcome {
        self.run_at(Local::now().naive_local()).await
    }

    /// Execute one run as if the clock read `now`
    pub async fn run_at(&self, now: NaiveDateTime) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let generation = match generation_for(now) {
            Ok(id) => id,
            Err(e) => {
                let failure = RunFailure::new(Stage::Start, e);
                error!(%run_id, stage = %failure.stage, error = %failure.cause, "Backup run failed");
                return Err(failure);
            }
        };
        let span = info_span!("run", %run_id, generation = %generation);

        async move {
            let outcome = self.execute(run_id, generation, now).await;
            self.close_remote().await;

            match &outcome {
                Ok(report) => info!(
                    stage = %Stage::Done,
                    status = ?report.status(),
                    pruned_local = report.local.deleted.len(),
                    pruned_remote = report.remote.deleted.len(),
                    warnings = report.warnings().count(),
                    "Backup run complete"
                ),
                Err(failure) => error!(
                    stage = %failure.stage,
                    error = %failure.cause,
                    "Backup run failed"
                ),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Validate the configuration and list what pruning would remove
    pub async fn plan(&self) -> Result<RunPlan> {
        self.plan_at(Local::now().naive_local()).await
    }

    pub async fn plan_at(&self, now: NaiveDateTime) -> Result<RunPlan> {
        self.config.validate()?;
        let generation = generation_for(now)?;

        let store = Arc::clone(&self.local);
        let existing = blocking(move || store.list()).await?;
        let local_expired = self.prunable(existing.iter().map(|g| g.id.to_string()), generation, now);

        let source = self.config.source.path.clone();
        let walk_options = WalkOptions::excluding(&self.config.source.exclude);
        let source_bytes = blocking(move || Ok(calculate_total_size(&source, &walk_options)?)).await?;

        Ok(RunPlan {
            generation,
            source_bytes,
            local_expired,
        })
    }

    async fn execute(&self, run_id: Uuid, id: GenerationId, now: NaiveDateTime) -> RunOutcome {
        info!(
            stage = %Stage::Start,
            source = %self.config.source.path.display(),
            remote = %self.config.remote.root(),
            retention_days = self.config.retention.days,
            "Starting backup run"
        );
        self.config
            .validate()
            .map_err(|e| RunFailure::new(Stage::Start, e))?;

        self.checkpoint(Stage::Snapshot)?;
        info!(stage = %Stage::Snapshot, "Creating local generation");
        let generation = self
            .snapshot(id)
            .await
            .map_err(|e| RunFailure::new(Stage::Snapshot, e))?;

        self.checkpoint(Stage::Upload)?;
        info!(stage = %Stage::Upload, "Uploading generation");
        let (upload, upload_attempts) = self
            .upload(&generation)
            .await
            .map_err(|e| RunFailure::new(Stage::Upload, e))?;

        let mut report = RunReport {
            run_id,
            generation: id,
            upload,
            upload_attempts,
            local: PruneSummary::default(),
            remote: PruneSummary::default(),
            prune_skipped: false,
        };

        // The new generation is safe on both ends from here on
        if self.cancel.is_cancelled() {
            warn!(stage = %Stage::PruneLocal, "Cancelled after upload, skipping prune");
            report.prune_skipped = true;
            return Ok(report);
        }

        report.local = self.prune_local(id, now).await;
        report.remote = self.prune_remote(id, now).await;
        Ok(report)
    }

    fn checkpoint(&self, next: Stage) -> std::result::Result<(), RunFailure> {
        if self.cancel.is_cancelled() {
            return Err(RunFailure::new(next, BackupError::Cancelled));
        }
        Ok(())
    }

    async fn snapshot(&self, id: GenerationId) -> Result<Generation> {
        let store = Arc::clone(&self.local);
        let source = self.config.source.path.clone();
        let policy = self.config.snapshot.on_collision;
        let cancel = self.cancel.clone();
        blocking(move || store.create(&source, id, policy, &cancel)).await
    }

    /// Upload with retries on transient failures. Returns the stats of the
    /// successful attempt and how many attempts it took.
    async fn upload(&self, generation: &Generation) -> Result<(TransferStats, u32)> {
        let settings = &self.config.upload;
        let mut attempt = 1;

        loop {
            let timer = TransferTimer::start();
            match self.upload_attempt(generation).await {
                Ok(stats) => {
                    info!(
                        stage = %Stage::Upload,
                        attempt,
                        files = stats.files,
                        size = %format_bytes(stats.bytes),
                        speed = %format_speed(timer.average_speed(stats.bytes)),
                        "Upload complete"
                    );
                    return Ok((stats, attempt));
                }
                Err(e) if e.is_transient() && attempt < settings.attempts => {
                    let backoff = settings.retry_delay(attempt);
                    warn!(
                        stage = %Stage::Upload,
                        attempt,
                        max_attempts = settings.attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Upload attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => return Err(BackupError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!(stage = %Stage::Upload, attempt, error = %e, "Upload failed");
                    return Err(e);
                }
            }
        }
    }

    async fn upload_attempt(&self, generation: &Generation) -> Result<TransferStats> {
        let root = self.config.remote.root().to_string();
        let local = generation.location.clone();
        let id = generation.id;
        let policy = self.config.snapshot.on_collision;
        let cancel = self.cancel.clone();

        with_remote(&self.remote, move |remote| {
            publish_remote(remote, &local, &root, id, policy, &cancel)
        })
        .await
    }

    /// Expired ids strictly older than the generation this run produced
    fn prunable<I, S>(&self, names: I, current: GenerationId, now: NaiveDateTime) -> Vec<GenerationId>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.retention
            .expired(names, now)
            .into_iter()
            .filter(|id| *id < current)
            .collect()
    }

    async fn prune_local(&self, current: GenerationId, now: NaiveDateTime) -> PruneSummary {
        let stage = Stage::PruneLocal;
        info!(stage = %stage, "Pruning local generations");
        let mut summary = PruneSummary::default();

        let store = Arc::clone(&self.local);
        let existing = match blocking(move || store.list()).await {
            Ok(generations) => generations,
            Err(e) => {
                warn!(stage = %stage, error = %e, "Could not list local generations");
                summary.failures.push(PruneFailure {
                    stage,
                    generation: None,
                    error: e.to_string(),
                });
                return summary;
            }
        };

        let expired = self.prunable(existing.iter().map(|g| g.id.to_string()), current, now);
        if expired.is_empty() {
            info!(stage = %stage, "No expired local generations");
        }

        let semaphore = Arc::new(Semaphore::new(self.config.prune.max_parallel));
        let mut handles = Vec::with_capacity(expired.len());

        for id in expired {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if self.cancel.is_cancelled() {
                warn!(stage = %stage, "Cancelled, leaving remaining local generations");
                summary.cancelled = true;
                break;
            }

            let store = Arc::clone(&self.local);
            let span = Span::current();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                span.in_scope(|| store.delete(id))
            });
            handles.push((id, handle));
        }

        // Submission order, every result accounted for
        for (id, handle) in handles {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(task_failed(e)));
            record(&mut summary, stage, id, result);
        }

        if !summary.cancelled {
            self.clear_local_leftovers(current, &mut summary).await;
        }
        summary
    }

    /// Remove staging and replaced directories of earlier days
    async fn clear_local_leftovers(&self, current: GenerationId, summary: &mut PruneSummary) {
        let stage = Stage::PruneLocal;
        let store = Arc::clone(&self.local);
        let leftovers = match blocking(move || store.leftovers()).await {
            Ok(found) => found,
            Err(e) => {
                warn!(stage = %stage, error = %e, "Could not list local leftovers");
                summary.failures.push(PruneFailure {
                    stage,
                    generation: None,
                    error: e.to_string(),
                });
                return;
            }
        };

        for leftover in leftovers.into_iter().filter(|l| l.id < current) {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let store = Arc::clone(&self.local);
            let target = leftover.clone();
            let result = blocking(move || store.remove_leftover(&target)).await;
            record_leftover(summary, stage, leftover, result);
        }
    }

    async fn prune_remote(&self, current: GenerationId, now: NaiveDateTime) -> PruneSummary {
        let stage = Stage::PruneRemote;
        info!(stage = %stage, "Pruning remote generations");
        let mut summary = PruneSummary::default();
        let root = self.config.remote.root().to_string();

        let listing_root = root.clone();
        let names = match with_remote(&self.remote, move |r| r.list_all(&listing_root)).await {
            Ok(names) => names,
            Err(e) => {
                warn!(stage = %stage, error = %e, "Could not list remote generations");
                summary.failures.push(PruneFailure {
                    stage,
                    generation: None,
                    error: e.to_string(),
                });
                return summary;
            }
        };

        let (hidden, visible): (Vec<String>, Vec<String>) =
            names.into_iter().partition(|name| name.starts_with('.'));
        let expired = self.prunable(&visible, current, now);
        let leftovers: Vec<Leftover> = hidden
            .iter()
            .filter_map(|name| Leftover::parse(name))
            .filter(|l| l.id < current)
            .collect();
        if expired.is_empty() {
            info!(stage = %stage, "No expired remote generations");
        }

        // One session, so one deletion at a time
        for id in expired {
            if self.cancel.is_cancelled() {
                warn!(stage = %stage, "Cancelled, leaving remaining remote generations");
                summary.cancelled = true;
                return summary;
            }
            let path = join_remote(&root, &id.to_string());
            let result = with_remote(&self.remote, move |r| r.delete_tree(&path)).await;
            record(&mut summary, stage, id, result);
        }

        for leftover in leftovers {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let path = join_remote(&root, &leftover.name);
            let result = with_remote(&self.remote, move |r| r.delete_tree(&path)).await;
            record_leftover(&mut summary, stage, leftover, result);
        }

        summary
    }

    async fn close_remote(&self) {
        if let Err(e) = with_remote(&self.remote, |r| r.close()).await {
            warn!(error = %e, "Failed to close remote session");
        }
    }
}

/// Upload one generation under a hidden staging name, then publish it.
fn publish_remote(
    remote: &mut dyn RemoteTransport,
    local: &Path,
    root: &str,
    id: GenerationId,
    policy: CollisionPolicy,
    cancel: &CancellationToken,
) -> Result<TransferStats> {
    let name = id.to_string();
    let target = join_remote(root, &name);
    let staging = join_remote(root, &id.staging_name());

    remote.ensure_directory(root)?;
    let exists = remote.list_directory(root)?.iter().any(|entry| *entry == name);
    if exists && policy == CollisionPolicy::Fail {
        return Err(BackupError::Protocol(format!(
            "remote generation {} already exists",
            target
        )));
    }

    // Leftover from an earlier failed attempt or run
    match remote.delete_tree(&staging) {
        Ok(()) => info!(path = %staging, "Removed stale remote staging directory"),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    let stats = remote.upload_tree(local, &staging, cancel)?;

    if !exists {
        remote.rename(&staging, &target)?;
    } else {
        // Keep the old copy until the new one is in place
        let replaced = join_remote(root, &id.replaced_name());
        match remote.delete_tree(&replaced) {
            Ok(()) | Err(BackupError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        remote.rename(&target, &replaced)?;
        remote.rename(&staging, &target)?;
        if let Err(e) = remote.delete_tree(&replaced) {
            warn!(path = %replaced, error = %e, "Could not remove replaced remote generation");
        }
        info!(path = %target, "Replaced existing remote generation");
    }

    info!(endpoint = %remote.endpoint(), path = %target, "Remote generation published");
    Ok(stats)
}

fn record(summary: &mut PruneSummary, stage: Stage, id: GenerationId, result: Result<()>) {
    match result {
        Ok(()) => summary.deleted.push(id),
        Err(e) if e.is_not_found() => {
            info!(stage = %stage, generation = %id, "Generation already gone");
            summary.deleted.push(id);
        }
        Err(e) => {
            warn!(stage = %stage, generation = %id, error = %e, "Failed to delete generation");
            summary.failures.push(PruneFailure {
                stage,
                generation: Some(id),
                error: e.to_string(),
            });
        }
    }
}

fn record_leftover(summary: &mut PruneSummary, stage: Stage, leftover: Leftover, result: Result<()>) {
    match result {
        Ok(()) => summary.cleared.push(leftover.name),
        Err(e) if e.is_not_found() => summary.cleared.push(leftover.name),
        Err(e) => {
            warn!(stage = %stage, name = %leftover.name, error = %e, "Failed to remove leftover");
            summary.failures.push(PruneFailure {
                stage,
                generation: Some(leftover.id),
                error: format!("{}: {}", leftover.name, e),
            });
        }
    }
}

/// Id of the generation a run at `now` produces
fn generation_for(now: NaiveDateTime) -> Result<GenerationId> {
    GenerationId::for_time(now)
        .ok_or_else(|| BackupError::Config(format!("clock reads {}, outside years 0000-9999", now)))
}

fn task_failed(err: tokio::task::JoinError) -> BackupError {
    BackupError::Io(std::io::Error::other(format!("blocking task failed: {}", err)))
}

/// Run blocking store work on the blocking pool, inside the caller's span
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let span = Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(f))
        .await
        .map_err(task_failed)?
}
