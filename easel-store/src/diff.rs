//! Structured diffs between two store epochs.
//!
//! A diff is the unit of persistence and network transmission: added
//! records, (old, new) update pairs, and removed records. Removed entries
//! carry the final record snapshot, not just the id, so adjacent diffs
//! compose without consulting external state.

use std::collections::BTreeMap;
use std::fmt;

use crate::record::{Record, RecordId};

/// Diff errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    /// `compose` requires the right-hand diff to start where the left-hand
    /// one ends.
    EpochMismatch { expected: u64, found: u64 },
}

impl fmt::Display for DiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffError::EpochMismatch { expected, found } => write!(
                f,
                "cannot compose diffs: expected from-epoch {expected}, found {found}"
            ),
        }
    }
}

impl std::error::Error for DiffError {}

/// Changes between `from_epoch` and `to_epoch`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordDiff {
    pub from_epoch: u64,
    pub to_epoch: u64,
    pub added: Vec<Record>,
    pub updated: Vec<(Record, Record)>,
    pub removed: Vec<Record>,
}

enum Net {
    Added(Record),
    Updated(Record, Record),
    Removed(Record),
}

impl RecordDiff {
    /// An empty diff covering no interval.
    pub fn empty(epoch: u64) -> Self {
        RecordDiff {
            from_epoch: epoch,
            to_epoch: epoch,
            ..RecordDiff::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Number of record entries in this diff.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    /// The subset touching durable (non-ephemeral) collections, which is
    /// what enters the transaction log and the wire.
    pub fn durable(&self) -> RecordDiff {
        RecordDiff {
            from_epoch: self.from_epoch,
            to_epoch: self.to_epoch,
            added: self
                .added
                .iter()
                .filter(|r| !r.kind().is_ephemeral())
                .cloned()
                .collect(),
            updated: self
                .updated
                .iter()
                .filter(|(_, new)| !new.kind().is_ephemeral())
                .cloned()
                .collect(),
            removed: self
                .removed
                .iter()
                .filter(|r| !r.kind().is_ephemeral())
                .cloned()
                .collect(),
        }
    }

    /// Compose two adjacent diffs into one covering the joint interval.
    ///
    /// `compose(diff[a,b], diff[b,c]) == diff[a,c]`; applying the result is
    /// equivalent to applying both in order.
    pub fn compose(&self, next: &RecordDiff) -> Result<RecordDiff, DiffError> {
        if next.from_epoch != self.to_epoch {
            return Err(DiffError::EpochMismatch {
                expected: self.to_epoch,
                found: next.from_epoch,
            });
        }
        let mut net: BTreeMap<RecordId, Net> = BTreeMap::new();
        for diff in [self, next] {
            for record in &diff.added {
                let entry = match net.remove(&record.id) {
                    // A record removed earlier in the interval and re-added
                    // nets out to an update.
                    Some(Net::Removed(old)) => Net::Updated(old, record.clone()),
                    Some(Net::Updated(old, _)) => Net::Updated(old, record.clone()),
                    _ => Net::Added(record.clone()),
                };
                net.insert(record.id.clone(), entry);
            }
            for (old, new) in &diff.updated {
                let entry = match net.remove(&new.id) {
                    Some(Net::Added(_)) => Net::Added(new.clone()),
                    Some(Net::Updated(first, _)) => Net::Updated(first, new.clone()),
                    Some(Net::Removed(first)) => Net::Updated(first, new.clone()),
                    None => Net::Updated(old.clone(), new.clone()),
                };
                net.insert(new.id.clone(), entry);
            }
            for record in &diff.removed {
                match net.remove(&record.id) {
                    // Added then removed within the interval: no net change.
                    Some(Net::Added(_)) => {}
                    Some(Net::Updated(first, _)) => {
                        net.insert(record.id.clone(), Net::Removed(first));
                    }
                    _ => {
                        net.insert(record.id.clone(), Net::Removed(record.clone()));
                    }
                }
            }
        }

        let mut composed = RecordDiff {
            from_epoch: self.from_epoch,
            to_epoch: next.to_epoch,
            ..RecordDiff::default()
        };
        for (_, entry) in net {
            match entry {
                Net::Added(r) => composed.added.push(r),
                Net::Updated(old, new) => composed.updated.push((old, new)),
                Net::Removed(r) => composed.removed.push(r),
            }
        }
        Ok(composed)
    }

    /// Apply this diff to a record map.
    pub fn apply_to(&self, records: &mut BTreeMap<RecordId, Record>) {
        for record in &self.removed {
            records.remove(&record.id);
        }
        for record in &self.added {
            records.insert(record.id.clone(), record.clone());
        }
        for (_, new) in &self.updated {
            records.insert(new.id.clone(), new.clone());
        }
    }
}
