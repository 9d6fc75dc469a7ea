//! Generation naming and the local snapshot store.
//!
//! A generation is one dated copy of the source tree. Its id is the
//! zero-padded calendar day it was taken (`YYYY-MM-DD`), so plain string
//! order is creation order and the id doubles as a directory name on both
//! the local disk and the remote.

pub mod store;

use crate::utils::errors::Result;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub use store::LocalSnapshotStore;

const ID_FORMAT: &str = "%Y-%m-%d";
const STAGING_SUFFIX: &str = ".partial";
const REPLACED_SUFFIX: &str = ".replaced";

/// Canonical `YYYY-MM-DD` identifier of a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GenerationId(NaiveDate);

impl GenerationId {
    /// Name the generation taken at `reference`. Same calendar day, same id.
    ///
    /// `None` for years outside `0..=9999`, which have no four-digit form.
    pub fn for_time(reference: NaiveDateTime) -> Option<Self> {
        (0..=9999)
            .contains(&reference.year())
            .then(|| Self(reference.date()))
    }

    /// Parse a directory or remote entry name. Only the exact canonical form
    /// is accepted; anything else is not a generation.
    pub fn parse(name: &str) -> Option<Self> {
        // chrono accepts unpadded fields, the canonical form does not
        if name.len() != 10 || !name.is_ascii() {
            return None;
        }
        let date = NaiveDate::parse_from_str(name, ID_FORMAT).ok()?;
        let id = Self(date);
        (id.to_string() == name).then_some(id)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Creation time, taken as midnight of the id's day
    pub fn created_at(&self) -> NaiveDateTime {
        self.0.and_time(NaiveTime::MIN)
    }

    /// Hidden sibling name used while a generation is still being written
    pub fn staging_name(&self) -> String {
        format!(".{}{}", self, STAGING_SUFFIX)
    }

    /// Hidden sibling name an overwritten generation is parked under
    pub fn replaced_name(&self) -> String {
        format!(".{}{}", self, REPLACED_SUFFIX)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(ID_FORMAT))
    }
}

impl TryFrom<String> for GenerationId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("not a generation id: {}", value))
    }
}

impl From<GenerationId> for String {
    fn from(id: GenerationId) -> Self {
        id.to_string()
    }
}

/// Hidden entry left behind by an interrupted publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leftover {
    /// Generation the entry was written for
    pub id: GenerationId,
    /// Entry name as found in the store
    pub name: String,
}

impl Leftover {
    /// Recognize `.<id>.partial` and `.<id>.replaced`
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix('.')?;
        let id = rest
            .strip_suffix(STAGING_SUFFIX)
            .or_else(|| rest.strip_suffix(REPLACED_SUFFIX))?;
        Some(Self {
            id: GenerationId::parse(id)?,
            name: name.to_string(),
        })
    }
}

/// A local generation on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub id: GenerationId,
    pub location: PathBuf,
}

/// Owner of the local generation lifecycle
pub trait SnapshotStore: Send + Sync {
    /// Copy `source` into a new, complete generation named `id`
    fn create(
        &self,
        source: &Path,
        id: GenerationId,
        policy: CollisionPolicy,
        cancel: &CancellationToken,
    ) -> Result<Generation>;

    /// Generations in id order, oldest first
    fn list(&self) -> Result<Vec<Generation>>;

    /// Remove a generation. [`BackupError::NotFound`](crate::BackupError::NotFound) if absent.
    fn delete(&self, id: GenerationId) -> Result<()>;

    /// Staging and replaced entries left by interrupted runs, in name order
    fn leftovers(&self) -> Result<Vec<Leftover>>;

    /// Remove one leftover. [`BackupError::NotFound`](crate::BackupError::NotFound) if absent.
    fn remove_leftover(&self, leftover: &Leftover) -> Result<()>;
}

/// What to do when today's generation already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Refuse to run again on the same day
    #[default]
    Fail,
    /// Replace the existing generation once the new one is complete
    Overwrite,
}
