//! Transaction log: a base snapshot plus a contiguous tail of diffs.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             TransactionLog                   │
//! │                                             │
//! │  base @ e₀  ◄── diff(e₀,e₁) ◄── diff(e₁,e₂) │
//! │                                             │
//! │  range(eᵢ, eⱼ): composed diff for catch-up  │
//! │  compact(e):  fold old diffs into the base  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Diffs append in strict epoch order. A receiver that would need an epoch
//! below the base has missed history that was already compacted away and
//! must take a full resync instead.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::diff::RecordDiff;
use crate::record::{Record, RecordId};

/// Transaction log errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// Appended diff does not start at the log head.
    NonContiguous { expected: u64, found: u64 },
    /// Requested interval reaches below the compacted base or beyond the
    /// head; the caller must resync from a snapshot.
    Gap {
        requested: u64,
        base: u64,
        head: u64,
    },
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::NonContiguous { expected, found } => write!(
                f,
                "non-contiguous append: log head is {expected}, diff starts at {found}"
            ),
            LogError::Gap {
                requested,
                base,
                head,
            } => write!(
                f,
                "epoch {requested} outside retained range [{base}, {head}]"
            ),
        }
    }
}

impl std::error::Error for LogError {}

/// Base snapshot + ordered diff tail for one document.
pub struct TransactionLog {
    base: BTreeMap<RecordId, Record>,
    base_epoch: u64,
    tail: VecDeque<RecordDiff>,
    /// Tail length at which [`needs_compaction`](Self::needs_compaction)
    /// starts reporting true. The owner decides when to actually compact
    /// (it knows how far consumers have acknowledged).
    compact_threshold: usize,
}

impl TransactionLog {
    pub fn new(base_epoch: u64) -> Self {
        Self::with_threshold(base_epoch, 256)
    }

    pub fn with_threshold(base_epoch: u64, compact_threshold: usize) -> Self {
        Self {
            base: BTreeMap::new(),
            base_epoch,
            tail: VecDeque::new(),
            compact_threshold,
        }
    }

    /// Reset to a fresh base snapshot, discarding all history.
    pub fn reset(&mut self, records: Vec<Record>, epoch: u64) {
        self.base = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        self.base_epoch = epoch;
        self.tail.clear();
    }

    pub fn base_epoch(&self) -> u64 {
        self.base_epoch
    }

    /// Epoch of the newest appended diff (or the base, when the tail is
    /// empty).
    pub fn head_epoch(&self) -> u64 {
        self.tail.back().map(|d| d.to_epoch).unwrap_or(self.base_epoch)
    }

    pub fn tail_len(&self) -> usize {
        self.tail.len()
    }

    pub fn needs_compaction(&self) -> bool {
        self.tail.len() >= self.compact_threshold
    }

    /// Append the next diff. Must start exactly at the current head.
    pub fn append(&mut self, diff: RecordDiff) -> Result<(), LogError> {
        let head = self.head_epoch();
        if diff.from_epoch != head {
            return Err(LogError::NonContiguous {
                expected: head,
                found: diff.from_epoch,
            });
        }
        self.tail.push_back(diff);
        Ok(())
    }

    /// Composed diff covering `(from, to]`. `from == to` yields an empty
    /// diff; an interval outside the retained range is a gap.
    pub fn range(&self, from: u64, to: u64) -> Result<RecordDiff, LogError> {
        let head = self.head_epoch();
        if from < self.base_epoch || to > head || from > to {
            return Err(LogError::Gap {
                requested: from,
                base: self.base_epoch,
                head,
            });
        }
        let mut composed = RecordDiff::empty(from);
        for diff in &self.tail {
            if diff.to_epoch <= from {
                continue;
            }
            if diff.from_epoch >= to {
                break;
            }
            composed = composed.compose(diff).map_err(|_| LogError::Gap {
                requested: from,
                base: self.base_epoch,
                head,
            })?;
        }
        composed.to_epoch = to;
        Ok(composed)
    }

    /// Fold every diff with `to_epoch <= before_epoch` into the base.
    /// Returns how many diffs were folded.
    pub fn compact(&mut self, before_epoch: u64) -> usize {
        let mut folded = 0;
        while let Some(front) = self.tail.front() {
            if front.to_epoch > before_epoch {
                break;
            }
            let diff = match self.tail.pop_front() {
                Some(d) => d,
                None => break,
            };
            diff.apply_to(&mut self.base);
            self.base_epoch = diff.to_epoch;
            folded += 1;
        }
        if folded > 0 {
            log::debug!(
                "compacted {folded} diffs into base at epoch {}",
                self.base_epoch
            );
        }
        folded
    }

    /// Materialize the record set at the head epoch: base plus tail replay.
    pub fn snapshot(&self) -> (Vec<Record>, u64) {
        let mut records = self.base.clone();
        for diff in &self.tail {
            diff.apply_to(&mut records);
        }
        (records.into_values().collect(), self.head_epoch())
    }
}
