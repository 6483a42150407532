//! Change-feed consumption: wire types, one-shot and long-poll paging, and
//! caught-up detection. The tracker task forwards parsed change entries to
//! the replicator worker and never touches replicator state itself.

// src/changes.rs
use crate::constants;
use crate::replica_client::ReplicaClient;
use crate::revision::{PulledRevision, RemoteSequence};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Operating mode of the change feed consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFeedMode {
    /// Request up to the feed limit, return immediately
    OneShot,
    /// Hang until at least one change, return, repeat
    LongPoll,
}

/// One leaf revision listed in a change entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeLeaf {
    pub rev: String,
}

/// One record from the remote change feed: the current leaves of a document
/// at a given remote sequence.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEntry {
    pub seq: RemoteSequence,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub changes: Vec<ChangeLeaf>,
}

/// One page of the change feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangesPage {
    #[serde(default)]
    pub results: Vec<ChangeEntry>,
    #[serde(default)]
    pub last_seq: Option<RemoteSequence>,
}

/// Parameters of a single change-feed request.
#[derive(Debug, Clone)]
pub struct ChangesQuery {
    pub since: Option<RemoteSequence>,
    pub limit: usize,
    pub mode: ChangeFeedMode,
    pub heartbeat: Option<Duration>,
    pub filter_name: Option<String>,
    pub filter_params: Vec<(String, String)>,
    pub doc_ids: Vec<String>,
}

/// Expand a change entry into one queued revision per listed leaf.
///
/// An entry listing more than one leaf means the document is in conflict on
/// the remote; every leaf from such an entry is marked conflicted. Leaves
/// with malformed revision ids are skipped silently.
pub fn revisions_from_entry(entry: &ChangeEntry) -> Vec<PulledRevision> {
    let conflicted = entry.changes.len() > 1;
    entry
        .changes
        .iter()
        .filter_map(|leaf| {
            PulledRevision::from_change(
                &entry.id,
                &leaf.rev,
                entry.deleted,
                conflicted,
                entry.seq.clone(),
            )
        })
        .collect()
}

/// Messages the tracker sends to the replicator worker.
#[derive(Debug)]
pub enum TrackerMessage {
    Changes(Vec<ChangeEntry>),
    /// Sent exactly once, the first time a response returns fewer entries
    /// than the feed limit
    CaughtUp,
    /// The tracker ended, cleanly (None) or with an error
    Stopped(Option<String>),
}

/// Configuration for one tracker run.
pub struct TrackerConfig {
    pub initial_mode: ChangeFeedMode,
    pub continuous: bool,
    pub since: Option<RemoteSequence>,
    pub heartbeat: Option<Duration>,
    pub filter_name: Option<String>,
    pub filter_params: Vec<(String, String)>,
    pub doc_ids: Vec<String>,
}

/// Consumes the remote change feed and forwards entries to the worker.
pub struct ChangeTracker {
    client: ReplicaClient,
    config: TrackerConfig,
    tx: mpsc::UnboundedSender<TrackerMessage>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChangeTracker {
    pub fn new(
        client: ReplicaClient,
        config: TrackerConfig,
        tx: mpsc::UnboundedSender<TrackerMessage>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            config,
            tx,
            shutdown_rx,
        }
    }

    /// Run the tracker to completion. OneShot mode pages the feed until a
    /// short page (the caught-up signal), then either ends or switches to
    /// long-poll for continuous replications.
    pub async fn run(self) {
        let mut mode = self.config.initial_mode;
        let mut since = self.config.since.clone();
        let mut caught_up_sent = false;

        loop {
            if *self.shutdown_rx.borrow() {
                let _ = self.tx.send(TrackerMessage::Stopped(None));
                return;
            }

            let query = ChangesQuery {
                since: since.clone(),
                limit: constants::CHANGES_FEED_LIMIT,
                mode,
                heartbeat: self.config.heartbeat,
                filter_name: self.config.filter_name.clone(),
                filter_params: self.config.filter_params.clone(),
                doc_ids: self.config.doc_ids.clone(),
            };

            let page = match self
                .client
                .fetch_changes(&query, Some(self.shutdown_rx.clone()))
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    let error = if *self.shutdown_rx.borrow() {
                        None
                    } else {
                        Some(e.to_string())
                    };
                    let _ = self.tx.send(TrackerMessage::Stopped(error));
                    return;
                }
            };

            let count = page.results.len();
            log::debug!("change feed returned {} entries (mode {:?})", count, mode);

            // Advance the cursor before handing entries off
            if let Some(last_seq) = page.last_seq {
                since = Some(last_seq);
            } else if let Some(last) = page.results.last() {
                since = Some(last.seq.clone());
            }

            if count > 0 && self.tx.send(TrackerMessage::Changes(page.results)).is_err() {
                // Worker went away; nothing left to report to
                return;
            }

            if count < constants::CHANGES_FEED_LIMIT {
                if !caught_up_sent {
                    caught_up_sent = true;
                    if self.tx.send(TrackerMessage::CaughtUp).is_err() {
                        return;
                    }
                }
                if mode == ChangeFeedMode::OneShot {
                    if self.config.continuous {
                        mode = ChangeFeedMode::LongPoll;
                    } else {
                        let _ = self.tx.send(TrackerMessage::Stopped(None));
                        return;
                    }
                }
            }
        }
    }
}
