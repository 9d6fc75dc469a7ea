//! What a run did, and how it maps onto the process exit code.

use crate::snapshot::GenerationId;
use crate::transfer::TransferStats;
use crate::utils::errors::BackupError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_SNAPSHOT: i32 = 3;
pub const EXIT_UPLOAD: i32 = 4;
pub const EXIT_CANCELLED: i32 = 130;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Snapshot,
    Upload,
    PruneLocal,
    PruneRemote,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Start => "start",
            Stage::Snapshot => "snapshot",
            Stage::Upload => "upload",
            Stage::PruneLocal => "prune_local",
            Stage::PruneRemote => "prune_remote",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// One prune step that did not go through
#[derive(Debug, Clone, Serialize)]
pub struct PruneFailure {
    pub stage: Stage,
    /// `None` when the failure hit the listing rather than one generation
    pub generation: Option<GenerationId>,
    pub error: String,
}

/// Result of one prune stage
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneSummary {
    pub deleted: Vec<GenerationId>,
    /// Hidden staging and replaced entries of earlier runs that were removed
    pub cleared: Vec<String>,
    pub failures: Vec<PruneFailure>,
    /// Remaining work was skipped because the run was cancelled
    pub cancelled: bool,
}

impl PruneSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    SucceededWithWarnings,
}

/// Report of a run whose snapshot and upload both succeeded
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub generation: GenerationId,
    pub upload: TransferStats,
    pub upload_attempts: u32,
    pub local: PruneSummary,
    pub remote: PruneSummary,
    /// Prune stages were not reached because of cancellation
    pub prune_skipped: bool,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.local.is_clean() && self.remote.is_clean() {
            RunStatus::Succeeded
        } else {
            RunStatus::SucceededWithWarnings
        }
    }

    /// Every prune failure, local first
    pub fn warnings(&self) -> impl Iterator<Item = &PruneFailure> {
        self.local.failures.iter().chain(self.remote.failures.iter())
    }
}

/// A run that stopped before its generation was safely off-site
#[derive(Debug, Error)]
#[error("run failed during {stage}: {cause}")]
pub struct RunFailure {
    pub stage: Stage,
    #[source]
    pub cause: BackupError,
}

impl RunFailure {
    pub fn new(stage: Stage, cause: BackupError) -> Self {
        Self { stage, cause }
    }

    pub fn exit_code(&self) -> i32 {
        if matches!(self.cause, BackupError::Cancelled) {
            return EXIT_CANCELLED;
        }
        match (self.stage, &self.cause) {
            (_, BackupError::Config(_)) => EXIT_CONFIG,
            (Stage::Start, _) => EXIT_CONFIG,
            (Stage::Snapshot, _) => EXIT_SNAPSHOT,
            _ => EXIT_UPLOAD,
        }
    }
}

pub type RunOutcome = std::result::Result<RunReport, RunFailure>;

pub fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        Ok(_) => EXIT_SUCCESS,
        Err(failure) => failure.exit_code(),
    }
}
