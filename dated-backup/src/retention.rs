//! Age-based retention.
//!
//! A generation is expired once it is strictly older than the retention
//! window, measured from midnight of its id's day. Names that do not parse
//! as generation ids are never expired here; hidden leftovers of
//! interrupted runs are cleared separately by the prune stages.

use crate::snapshot::GenerationId;
use chrono::{NaiveDateTime, TimeDelta};
use std::collections::BTreeSet;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    window: TimeDelta,
}

impl RetentionPolicy {
    pub fn new(window: TimeDelta) -> Self {
        Self { window }
    }

    pub fn from_days(days: u32) -> Self {
        Self::new(TimeDelta::days(i64::from(days)))
    }

    pub fn is_expired(&self, id: GenerationId, now: NaiveDateTime) -> bool {
        now - id.created_at() > self.window
    }

    /// Expired subset of `names`, as parsed ids
    pub fn expired<I, S>(&self, names: I, now: NaiveDateTime) -> BTreeSet<GenerationId>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .filter_map(|name| {
                let name = name.as_ref();
                let parsed = GenerationId::parse(name);
                if parsed.is_none() && !name.starts_with('.') {
                    warn!(name = %name, "Skipping entry, not a valid generation name");
                }
                parsed
            })
            .filter(|id| self.is_expired(*id, now))
            .collect()
    }
}
