//! Local replica store interface consumed by the puller. The store owns
//! revision trees, validation, and its own concurrency; the puller only
//! drives it through this seam.

// src/store.rs
use crate::revision::{PulledRevision, expand_revision_history};
use anyhow::Result;
use serde_json::Value;

/// Outcome of a single forced insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Revision stored (or already present)
    Inserted,
    /// Rejected by a validation function; the revision is considered
    /// delivered and the checkpoint may advance past it
    Forbidden,
    /// The store is busy; the whole transaction must be retried
    Busy,
    /// Any other write failure
    Failed(String),
}

/// What a transaction body asks the store to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionResult {
    Commit,
    /// Abort and re-run the body (returned on `InsertOutcome::Busy`)
    Retry,
}

/// Interface of the local replica store.
pub trait ReplicaStore: Send + Sync {
    /// Document-id predicate applied to incoming change entries.
    fn is_valid_document_id(&self, id: &str) -> bool {
        !id.is_empty() && (!id.starts_with('_') || id.starts_with("_design/"))
    }

    /// Remove revisions already known locally from `revs`, in place.
    fn find_missing_revisions(&self, revs: &mut Vec<PulledRevision>) -> Result<()>;

    /// Local revision ids that may be ancestors of `rev`, newest first,
    /// capped at `limit`, plus whether the local document has attachments.
    fn possible_ancestor_ids(&self, rev: &PulledRevision, limit: usize) -> (Vec<String>, bool);

    /// Run `block` transactionally. The store re-runs the body whenever it
    /// returns `Retry`.
    fn in_transaction(&self, block: &mut dyn FnMut() -> TransactionResult) -> Result<()>;

    /// Insert a fetched revision with its history, recording `source` as the
    /// replication origin.
    fn force_insert(&self, rev: &PulledRevision, history: &[String], source: &str)
    -> InsertOutcome;

    /// Extract the revision history from a fetched body. The default reads
    /// the `_revisions` field.
    fn parse_revision_history(&self, properties: &Value) -> Option<Vec<String>> {
        expand_revision_history(properties)
    }
}
