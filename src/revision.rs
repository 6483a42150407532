// src/revision.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque ordering token from the remote change feed.
///
/// Remotes report sequences either as integers or as strings (clustered
/// backends use composite string cursors). The value is never interpreted,
/// only carried, compared for equality, and persisted as the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteSequence {
    Number(u64),
    Text(String),
}

impl RemoteSequence {
    /// Render the sequence the way the change feed expects it in `since=`
    pub fn as_since_param(&self) -> String {
        match self {
            RemoteSequence::Number(n) => n.to_string(),
            RemoteSequence::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for RemoteSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteSequence::Number(n) => write!(f, "{}", n),
            RemoteSequence::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for RemoteSequence {
    fn from(n: u64) -> Self {
        RemoteSequence::Number(n)
    }
}

impl From<&str> for RemoteSequence {
    fn from(s: &str) -> Self {
        RemoteSequence::Text(s.to_string())
    }
}

/// One revision queued for download from the remote replica.
///
/// Immutable after its local `sequence` is assigned, except for `properties`
/// which is set once when the fetch completes.
#[derive(Debug, Clone)]
pub struct PulledRevision {
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    /// Integer prefix of `rev_id`; always >= 1
    pub generation: u32,
    /// The change entry listed more than one leaf for this document
    pub conflicted: bool,
    /// Sequence token of the change entry this revision came from
    pub remote_seq: RemoteSequence,
    /// Dense local sequence assigned by the SequenceMap (0 = unassigned)
    pub sequence: u64,
    /// Fetched document body, including `_revisions` when requested
    pub properties: Option<Value>,
}

impl PulledRevision {
    /// Build a revision from a change entry leaf. Returns None when the
    /// revision id is malformed (no parseable generation prefix).
    pub fn from_change(
        doc_id: &str,
        rev_id: &str,
        deleted: bool,
        conflicted: bool,
        remote_seq: RemoteSequence,
    ) -> Option<Self> {
        let generation = generation_of(rev_id)?;
        Some(Self {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
            deleted,
            generation,
            conflicted,
            remote_seq,
            sequence: 0,
            properties: None,
        })
    }

    /// Eligible for the bulk fetch path: an initial revision that is neither
    /// a tombstone nor one leaf of a conflict.
    pub fn bulk_eligible(&self) -> bool {
        self.generation == 1 && !self.deleted && !self.conflicted
    }
}

/// Parse the generation prefix of a revision id ("3-abc" -> 3).
/// Returns None for ids without a positive integer prefix.
pub fn generation_of(rev_id: &str) -> Option<u32> {
    let prefix = rev_id.split('-').next()?;
    match prefix.parse::<u32>() {
        Ok(generation) if generation >= 1 => Some(generation),
        _ => None,
    }
}

/// Expand the `_revisions` field of a fetched document into a revision
/// history list, newest first ("4-d", "3-c", "2-b", "1-a").
///
/// Returns None when the field is absent or malformed.
pub fn expand_revision_history(properties: &Value) -> Option<Vec<String>> {
    let revisions = properties.get("_revisions")?;
    let start = revisions.get("start")?.as_u64()?;
    let ids = revisions.get("ids")?.as_array()?;
    if start == 0 || ids.is_empty() || (start as usize) < ids.len() {
        return None;
    }

    let mut history = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let suffix = id.as_str()?;
        history.push(format!("{}-{}", start - i as u64, suffix));
    }
    Some(history)
}
