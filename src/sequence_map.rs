//! In-flight sequence bookkeeping: dense local sequences mapped to opaque remote
//! sequence tokens, with a checkpoint that only advances over contiguously
//! completed work.

// src/sequence_map.rs
use crate::revision::RemoteSequence;
use std::collections::{BTreeMap, BTreeSet};

/// Tracks which remote sequences are still being processed.
///
/// Downloads complete out of order, but a crash-restart resumes from the
/// checkpoint, so the checkpoint may only name a remote sequence whose every
/// predecessor has been removed. At worst a restart replays already-inserted
/// revisions, which the store absorbs idempotently.
#[derive(Debug, Default)]
pub struct SequenceMap {
    /// Remote token for every assigned sequence at or above the checkpoint
    values: BTreeMap<u64, RemoteSequence>,
    /// Sequences assigned but not yet removed
    pending: BTreeSet<u64>,
    /// Highest sequence handed out so far (0 = none)
    last_assigned: u64,
}

impl SequenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prime the map with a persisted checkpoint so that
    /// `checkpointed_value()` returns it until new work arrives.
    pub fn prime(&mut self, last_sequence: RemoteSequence) {
        let seq = self.add_value(last_sequence);
        self.remove_sequence(seq);
    }

    /// Assign the next dense sequence to a remote token.
    pub fn add_value(&mut self, remote: RemoteSequence) -> u64 {
        self.last_assigned += 1;
        self.values.insert(self.last_assigned, remote);
        self.pending.insert(self.last_assigned);
        self.last_assigned
    }

    /// Mark a sequence as fully processed.
    pub fn remove_sequence(&mut self, seq: u64) {
        if self.pending.remove(&seq) {
            self.prune();
        }
    }

    /// Remote token of the highest sequence S such that every sequence <= S
    /// has been removed; the last assigned token when nothing is pending.
    /// None until anything has been assigned.
    pub fn checkpointed_value(&self) -> Option<&RemoteSequence> {
        let seq = match self.pending.first() {
            Some(&min_pending) => min_pending.checked_sub(1)?,
            None => self.last_assigned,
        };
        self.values.get(&seq)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop tokens below the checkpoint; they can never be named again.
    fn prune(&mut self) {
        let floor = match self.pending.first() {
            Some(&min_pending) => min_pending.saturating_sub(1),
            None => self.last_assigned,
        };
        self.values = self.values.split_off(&floor);
    }
}
