//! Pull replicator core: consumes the change feed, routes revisions across
//! bulk/individual/deleted fetch queues, downloads with bounded concurrency,
//! inserts in batches, and advances a gap-free checkpoint.

// Puller module - change feed to local store pipeline
use crate::batcher::Batcher;
use crate::changes::{
    ChangeFeedMode, ChangeTracker, TrackerConfig, TrackerMessage, revisions_from_entry,
};
use crate::constants;
use crate::options::PullOptions;
use crate::replica_client::{BulkRow, ReplicaClient, is_offline_error};
use crate::revision::{PulledRevision, RemoteSequence};
use crate::runtime::{PullRuntime, TaskCounter};
use crate::sequence_map::SequenceMap;
use crate::store::{InsertOutcome, ReplicaStore, TransactionResult};
use anyhow::Result;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

// ============================================================================
// Pull Events
// ============================================================================

#[derive(Debug, Clone)]
pub enum PullEvent {
    /// The change feed returned a short page for the first time this run
    CaughtUp {
        last_sequence: Option<RemoteSequence>,
        pending: usize,
    },
    /// The durable checkpoint moved forward
    CheckpointAdvanced { last_sequence: RemoteSequence },
    BatchInserted {
        inserted: usize,
        forbidden: usize,
        failed: usize,
        duration_ms: u64,
    },
    WentOffline,
    WentOnline,
    Error { error: String },
}

// ============================================================================
// Pull Logger Trait
// ============================================================================

/// Trait for observing replication events
pub trait PullLogger: Send + Sync {
    fn on_caught_up(&self, _last_sequence: Option<&RemoteSequence>, _pending: usize) {}
    fn on_checkpoint(&self, _last_sequence: &RemoteSequence) {}
    fn on_batch_inserted(&self, _inserted: usize, _forbidden: usize, _failed: usize, _ms: u64) {}
    fn on_offline(&self) {}
    fn on_online(&self) {}
    fn on_error(&self, _error: &str) {}
}

/// Logger that forwards events to the `log` crate
pub struct LogPullLogger;

impl PullLogger for LogPullLogger {
    fn on_caught_up(&self, last_sequence: Option<&RemoteSequence>, pending: usize) {
        match last_sequence {
            Some(seq) => log::info!("caught up at {} ({} revisions pending)", seq, pending),
            None => log::info!("caught up ({} revisions pending)", pending),
        }
    }

    fn on_checkpoint(&self, last_sequence: &RemoteSequence) {
        log::debug!("checkpoint advanced to {}", last_sequence);
    }

    fn on_batch_inserted(&self, inserted: usize, forbidden: usize, failed: usize, ms: u64) {
        log::info!(
            "inserted batch: {} stored, {} forbidden, {} failed in {}ms",
            inserted,
            forbidden,
            failed,
            ms
        );
    }

    fn on_offline(&self) {
        log::warn!("replicator went offline");
    }

    fn on_online(&self) {
        log::info!("replicator back online");
    }

    fn on_error(&self, error: &str) {
        log::error!("replication error: {}", error);
    }
}

// ============================================================================
// Status and Stats
// ============================================================================

/// Snapshot of replication progress, published over a watch channel.
#[derive(Debug, Clone, Default)]
pub struct PullStatus {
    pub running: bool,
    pub online: bool,
    pub caught_up: bool,
    pub changes_total: u64,
    pub changes_processed: u64,
    /// Durable checkpoint to persist for the next run
    pub last_sequence: Option<RemoteSequence>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PullStats {
    pub batches_inserted: usize,
    pub revisions_inserted: usize,
    pub revisions_forbidden: usize,
    pub revisions_failed: usize,
    pub total_duration: Duration,
}

// ============================================================================
// Worker State
// ============================================================================

/// All mutable replication state. Touched only from the worker loop.
struct PullState {
    seq_map: SequenceMap,
    bulk_revs: VecDeque<PulledRevision>,
    revs: VecDeque<PulledRevision>,
    deleted_revs: VecDeque<PulledRevision>,
    http_connections: usize,
    online: bool,
    caught_up: bool,
    changes_total: u64,
    changes_processed: u64,
    last_sequence: Option<RemoteSequence>,
    error: Option<String>,
    /// Open "waiting to catch up" task (balanced once per begin)
    catch_up_task_open: bool,
    /// Open "tracker running" task (one-shot replications only)
    tracker_task_open: bool,
}

impl PullState {
    fn new(last_sequence: Option<RemoteSequence>) -> Self {
        Self {
            seq_map: SequenceMap::new(),
            bulk_revs: VecDeque::new(),
            revs: VecDeque::new(),
            deleted_revs: VecDeque::new(),
            http_connections: 0,
            online: true,
            caught_up: false,
            changes_total: 0,
            changes_processed: 0,
            last_sequence,
            error: None,
            catch_up_task_open: false,
            tracker_task_open: false,
        }
    }

    fn queues_empty(&self) -> bool {
        self.bulk_revs.is_empty() && self.revs.is_empty() && self.deleted_revs.is_empty()
    }

    fn clear_queues(&mut self) {
        self.bulk_revs.clear();
        self.revs.clear();
        self.deleted_revs.clear();
    }
}

/// One unit of work picked by the fetch dispatcher.
#[derive(Debug)]
enum FetchWork {
    Bulk(Vec<PulledRevision>),
    Single(PulledRevision),
}

/// Pick the next fetch in priority order: bulk first (demoting a singleton to
/// the individual path), then live revisions, then tombstones.
fn next_fetch_work(state: &mut PullState) -> Option<FetchWork> {
    loop {
        if !state.bulk_revs.is_empty() {
            // A bulk request for one key is more expensive than a plain GET
            if state.bulk_revs.len() == 1 {
                let rev = state.bulk_revs.pop_front().unwrap();
                state.revs.push_back(rev);
                continue;
            }
            let take = state.bulk_revs.len().min(constants::MAX_REVS_TO_GET_IN_BULK);
            return Some(FetchWork::Bulk(state.bulk_revs.drain(..take).collect()));
        }
        if let Some(rev) = state.revs.pop_front() {
            return Some(FetchWork::Single(rev));
        }
        if let Some(rev) = state.deleted_revs.pop_front() {
            return Some(FetchWork::Single(rev));
        }
        return None;
    }
}

/// Completions sent back to the worker by spawned fetch tasks.
#[derive(Debug)]
enum FetchMessage {
    SingleDone {
        rev: PulledRevision,
        result: Result<Value, String>,
    },
    BulkDone {
        remaining: Vec<PulledRevision>,
        result: Result<Vec<BulkRow>, String>,
    },
}

// ============================================================================
// Puller
// ============================================================================

/// Pull replicator: drives one replication against a remote replica.
///
/// All state is owned by the `run` future (the single logical worker);
/// change-feed output and HTTP completions are serialized onto it through
/// channels.
pub struct Puller {
    store: Arc<dyn ReplicaStore>,
    client: ReplicaClient,
    options: PullOptions,
    logger: Option<Box<dyn PullLogger>>,
    #[allow(clippy::type_complexity)]
    event_callback: Option<Box<dyn Fn(&PullEvent) + Send + Sync>>,
    status_tx: watch::Sender<PullStatus>,
    status_rx: watch::Receiver<PullStatus>,
    tasks: TaskCounter,
    runtime: PullRuntime,
}

impl Puller {
    pub fn new(store: Arc<dyn ReplicaStore>, options: PullOptions) -> Result<Self> {
        let client = ReplicaClient::new(&options)?;
        let (status_tx, status_rx) = watch::channel(PullStatus::default());
        Ok(Self {
            store,
            client,
            options,
            logger: None,
            event_callback: None,
            status_tx,
            status_rx,
            tasks: TaskCounter::new(),
            runtime: PullRuntime::new(),
        })
    }

    /// Set a logger for replication events
    pub fn with_logger<L>(mut self, logger: L) -> Self
    where
        L: PullLogger + 'static,
    {
        self.logger = Some(Box::new(logger));
        self
    }

    /// Set a custom event callback (for advanced use cases)
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PullEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(Box::new(callback));
        self
    }

    /// Watch replication progress
    pub fn status(&self) -> watch::Receiver<PullStatus> {
        self.status_rx.clone()
    }

    /// Async-task accounting; idle means no fetch, insert, or feed work is
    /// outstanding
    pub fn task_counter(&self) -> TaskCounter {
        self.tasks.clone()
    }

    /// Runtime handle for programmatic shutdown
    pub fn runtime(&self) -> PullRuntime {
        self.runtime.clone()
    }

    fn handle_event(&self, event: &PullEvent) {
        if let Some(callback) = &self.event_callback {
            callback(event);
        }
        if let Some(logger) = &self.logger {
            match event {
                PullEvent::CaughtUp {
                    last_sequence,
                    pending,
                } => logger.on_caught_up(last_sequence.as_ref(), *pending),
                PullEvent::CheckpointAdvanced { last_sequence } => {
                    logger.on_checkpoint(last_sequence)
                }
                PullEvent::BatchInserted {
                    inserted,
                    forbidden,
                    failed,
                    duration_ms,
                } => logger.on_batch_inserted(*inserted, *forbidden, *failed, *duration_ms),
                PullEvent::WentOffline => logger.on_offline(),
                PullEvent::WentOnline => logger.on_online(),
                PullEvent::Error { error } => logger.on_error(error),
            }
        }
    }

    fn publish_status(&self, state: &PullState, running: bool) {
        self.status_tx.send_replace(PullStatus {
            running,
            online: state.online,
            caught_up: state.caught_up,
            changes_total: state.changes_total,
            changes_processed: state.changes_processed,
            last_sequence: state.last_sequence.clone(),
            error: state.error.clone(),
        });
    }

    fn record_error(&self, state: &mut PullState, error: String) {
        log::warn!("replication error: {}", error);
        if state.error.is_none() {
            state.error = Some(error.clone());
        }
        self.handle_event(&PullEvent::Error { error });
    }

    // === Revision Router ===

    /// Process one inbox batch: drop revisions the store already has, then
    /// route the rest across the three fetch queues, assigning local
    /// sequences in feed order.
    fn process_inbox(&self, state: &mut PullState, mut inbox: Vec<PulledRevision>) {
        let total_before = inbox.len() as u64;
        let last_remote_seq = inbox.last().map(|rev| rev.remote_seq.clone());

        if let Err(e) = self.store.find_missing_revisions(&mut inbox) {
            // Drop the batch rather than abort the run; a later run refetches
            // from the checkpoint
            log::warn!(
                "findMissingRevisions failed ({}), discarding batch of {}",
                e,
                total_before
            );
            state.changes_total = state.changes_total.saturating_sub(total_before);
            return;
        }

        let removed = total_before - inbox.len() as u64;
        state.changes_total = state.changes_total.saturating_sub(removed);

        if inbox.is_empty() {
            // Everything was already known: checkpoint the whole batch by
            // cycling its last remote sequence through the map
            if let Some(remote) = last_remote_seq {
                let seq = state.seq_map.add_value(remote);
                state.seq_map.remove_sequence(seq);
                self.update_checkpoint(state);
            }
            return;
        }

        log::debug!(
            "routing {} revisions ({} already known)",
            inbox.len(),
            removed
        );
        for mut rev in inbox {
            let eligible = rev.bulk_eligible();
            rev.sequence = state.seq_map.add_value(rev.remote_seq.clone());
            if eligible {
                state.bulk_revs.push_back(rev);
            } else if rev.deleted {
                state.deleted_revs.push_back(rev);
            } else {
                state.revs.push_back(rev);
            }
        }
    }

    // === Fetch Dispatcher ===

    /// Issue fetches until the connection cap is reached or the queues drain.
    fn pull_remote_revisions(
        &self,
        state: &mut PullState,
        fetches: &mut JoinSet<()>,
        fetch_tx: &mpsc::UnboundedSender<FetchMessage>,
    ) {
        while state.http_connections < constants::MAX_OPEN_HTTP_CONNECTIONS {
            match next_fetch_work(state) {
                Some(FetchWork::Single(rev)) => self.spawn_single(state, rev, fetches, fetch_tx),
                Some(FetchWork::Bulk(revs)) => self.spawn_bulk(state, revs, fetches, fetch_tx),
                None => break,
            }
        }
    }

    fn spawn_single(
        &self,
        state: &mut PullState,
        rev: PulledRevision,
        fetches: &mut JoinSet<()>,
        fetch_tx: &mpsc::UnboundedSender<FetchMessage>,
    ) {
        state.http_connections += 1;
        self.tasks.started();

        // Send ancestor ids only when the local document carries attachments
        // the remote could then skip
        let (ancestors, has_attachments) = self
            .store
            .possible_ancestor_ids(&rev, constants::MAX_NUMBER_OF_ATTS_SINCE);
        let atts_since = if has_attachments { ancestors } else { Vec::new() };

        let client = self.client.clone();
        let tx = fetch_tx.clone();
        fetches.spawn(async move {
            let result = client
                .fetch_revision(&rev.doc_id, &rev.rev_id, &atts_since)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(FetchMessage::SingleDone { rev, result });
        });
    }

    fn spawn_bulk(
        &self,
        state: &mut PullState,
        revs: Vec<PulledRevision>,
        fetches: &mut JoinSet<()>,
        fetch_tx: &mpsc::UnboundedSender<FetchMessage>,
    ) {
        state.http_connections += 1;
        self.tasks.started();

        let doc_ids: Vec<String> = revs.iter().map(|rev| rev.doc_id.clone()).collect();
        let client = self.client.clone();
        let tx = fetch_tx.clone();
        fetches.spawn(async move {
            let result = client.bulk_fetch(&doc_ids).await.map_err(|e| e.to_string());
            let _ = tx.send(FetchMessage::BulkDone {
                remaining: revs,
                result,
            });
        });
    }

    // === Inserter ===

    /// Insert a batch of downloaded revisions in one store transaction and
    /// advance the checkpoint over the contiguously completed prefix.
    fn insert_downloads(
        &self,
        state: &mut PullState,
        stats: &mut PullStats,
        mut batch: Vec<PulledRevision>,
    ) {
        if batch.is_empty() {
            return;
        }
        batch.sort_by_key(|rev| rev.sequence);
        let start = Instant::now();
        let source = self.client.base_url().to_string();
        let store = self.store.clone();

        let mut inserted = 0usize;
        let mut forbidden = 0usize;
        let mut failed = 0usize;
        let mut completed: Vec<u64> = Vec::new();
        let mut first_error: Option<String> = None;

        let result = store.in_transaction(&mut || {
            // The body may re-run after a Busy abort; start from scratch
            inserted = 0;
            forbidden = 0;
            failed = 0;
            completed.clear();
            first_error = None;

            for rev in &batch {
                let history = rev
                    .properties
                    .as_ref()
                    .and_then(|props| store.parse_revision_history(props));
                let history = match history {
                    Some(history) => history,
                    None if rev.generation > 1 => {
                        // The remote omitted the ancestry we asked for; the
                        // sequence stays pending so the checkpoint cannot
                        // cross it
                        failed += 1;
                        if first_error.is_none() {
                            first_error = Some(format!(
                                "missing revision history for {} {}",
                                rev.doc_id, rev.rev_id
                            ));
                        }
                        continue;
                    }
                    None => vec![rev.rev_id.clone()],
                };

                match store.force_insert(rev, &history, &source) {
                    InsertOutcome::Inserted => {
                        inserted += 1;
                        completed.push(rev.sequence);
                    }
                    InsertOutcome::Forbidden => {
                        // Validation rejected it; still delivered, still
                        // checkpointable
                        log::info!("validation rejected {} {}", rev.doc_id, rev.rev_id);
                        forbidden += 1;
                        completed.push(rev.sequence);
                    }
                    InsertOutcome::Busy => return TransactionResult::Retry,
                    InsertOutcome::Failed(e) => {
                        failed += 1;
                        if first_error.is_none() {
                            first_error = Some(format!(
                                "insert failed for {} {}: {}",
                                rev.doc_id, rev.rev_id, e
                            ));
                        }
                    }
                }
            }
            TransactionResult::Commit
        });

        match result {
            Ok(()) => {
                for seq in completed {
                    state.seq_map.remove_sequence(seq);
                }
                if let Some(error) = first_error {
                    self.record_error(state, error);
                }
            }
            Err(e) => {
                // Nothing committed; every sequence stays pending
                failed = batch.len();
                inserted = 0;
                forbidden = 0;
                self.record_error(state, format!("insert transaction failed: {}", e));
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        state.changes_processed += batch.len() as u64;
        self.tasks.finished(batch.len());
        stats.batches_inserted += 1;
        stats.revisions_inserted += inserted;
        stats.revisions_forbidden += forbidden;
        stats.revisions_failed += failed;

        self.update_checkpoint(state);
        self.handle_event(&PullEvent::BatchInserted {
            inserted,
            forbidden,
            failed,
            duration_ms,
        });
        self.publish_status(state, true);
    }

    fn update_checkpoint(&self, state: &mut PullState) {
        if let Some(value) = state.seq_map.checkpointed_value()
            && state.last_sequence.as_ref() != Some(value)
        {
            let value = value.clone();
            state.last_sequence = Some(value.clone());
            self.handle_event(&PullEvent::CheckpointAdvanced {
                last_sequence: value,
            });
        }
    }

    // === Lifecycle ===

    fn begin_replicating(
        &self,
        state: &mut PullState,
        was_caught_up: bool,
    ) -> (mpsc::UnboundedReceiver<TrackerMessage>, JoinHandle<()>) {
        state.seq_map = SequenceMap::new();
        if let Some(seq) = state.last_sequence.clone() {
            state.seq_map.prime(seq);
        }
        state.caught_up = false;
        state.clear_queues();

        // Waiting to catch up
        self.tasks.started();
        state.catch_up_task_open = true;
        if !self.options.continuous {
            // Tracker running
            self.tasks.started();
            state.tracker_task_open = true;
        }

        let initial_mode = if self.options.continuous && was_caught_up {
            ChangeFeedMode::LongPoll
        } else {
            ChangeFeedMode::OneShot
        };
        log::debug!(
            "starting change tracker (mode {:?}, since {:?})",
            initial_mode,
            state.last_sequence
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = ChangeTracker::new(
            self.client.clone(),
            TrackerConfig {
                initial_mode,
                continuous: self.options.continuous,
                since: state.last_sequence.clone(),
                heartbeat: self.options.effective_heartbeat(),
                filter_name: self.options.filter_name.clone(),
                filter_params: self.options.filter_params.clone(),
                doc_ids: self.options.doc_ids.clone(),
            },
            tx,
            self.runtime.shutdown_signal(),
        );
        let handle = tokio::spawn(tracker.run());
        self.publish_status(state, true);
        (rx, handle)
    }

    /// Tear down the tracker and in-flight fetches, flushing completed
    /// downloads into the store and balancing every outstanding task.
    async fn teardown(
        &self,
        state: &mut PullState,
        stats: &mut PullStats,
        inbox: &mut Batcher<PulledRevision>,
        downloads: &mut Batcher<PulledRevision>,
        fetches: &mut JoinSet<()>,
        fetch_rx: &mut mpsc::UnboundedReceiver<FetchMessage>,
        tracker_handle: &mut Option<JoinHandle<()>>,
    ) {
        if let Some(handle) = tracker_handle.take() {
            handle.abort();
        }
        if state.catch_up_task_open {
            self.tasks.finished(1);
            state.catch_up_task_open = false;
        }
        if state.tracker_task_open {
            self.tasks.finished(1);
            state.tracker_task_open = false;
        }

        // Unrouted inbox entries are abandoned; the next run refetches them
        // from the checkpoint
        let dropped = inbox.flush_all().len() as u64;
        state.changes_total = state.changes_total.saturating_sub(dropped);

        // Wait for aborted fetch tasks to terminate before draining their
        // channel, so no completion can race past the drain
        fetches.abort_all();
        while fetches.join_next().await.is_some() {}
        self.tasks.finished(state.http_connections);
        state.http_connections = 0;
        while fetch_rx.try_recv().is_ok() {}

        // Insert whatever finished downloading before the teardown
        let batch = downloads.flush_all();
        self.insert_downloads(state, stats, batch);

        state.clear_queues();
        self.publish_status(state, true);
    }

    /// Run the replication to completion.
    ///
    /// One-shot replications return after catching up and draining. Continuous
    /// replications run until the shutdown signal fires, retrying through
    /// offline periods with exponential backoff. Per-revision failures are
    /// recorded in the status and stats; the run itself fails only when the
    /// change feed dies on a one-shot run or a continuous run exhausts its
    /// retry budget.
    pub async fn run(&mut self) -> Result<PullStats> {
        let run_start = Instant::now();
        let mut stats = PullStats::default();
        let mut state = PullState::new(self.options.last_sequence.clone());

        // External stop requests feed the internal runtime
        if let Some(mut external) = self.options.shutdown_rx.clone() {
            let runtime = self.runtime.clone();
            tokio::spawn(async move {
                loop {
                    if *external.borrow() {
                        runtime.trigger_shutdown();
                        return;
                    }
                    if external.changed().await.is_err() {
                        runtime.trigger_shutdown();
                        return;
                    }
                }
            });
        }

        let mut shutdown_rx = self.runtime.shutdown_signal();
        let mut online_rx = self.options.online_rx.clone();
        let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel::<FetchMessage>();
        let mut fetches: JoinSet<()> = JoinSet::new();
        let mut inbox: Batcher<PulledRevision> = Batcher::new(constants::BATCHER_CAPACITY);
        let mut downloads: Batcher<PulledRevision> = Batcher::new(constants::BATCHER_CAPACITY);

        let (mut tracker_rx, handle) = self.begin_replicating(&mut state, false);
        let mut tracker_handle = Some(handle);
        let mut tracker_done = false;
        let mut tracker_error: Option<String> = None;
        let mut consecutive_errors: u32 = 0;

        enum Incoming {
            Tracker(TrackerMessage),
            TrackerClosed,
            Fetch(FetchMessage),
            Shutdown,
            OnlineChanged,
        }

        loop {
            // Worker turn: flush batches deferred from the previous turn,
            // then dispatch whatever the queues hold
            if !inbox.is_empty() {
                let batch = inbox.flush_all();
                self.process_inbox(&mut state, batch);
            }
            if !downloads.is_empty() {
                let batch = downloads.flush_all();
                self.insert_downloads(&mut state, &mut stats, batch);
            }
            if !state.queues_empty() {
                self.pull_remote_revisions(&mut state, &mut fetches, &fetch_tx);
            }

            if self.runtime.is_shutdown() {
                self.teardown(
                    &mut state,
                    &mut stats,
                    &mut inbox,
                    &mut downloads,
                    &mut fetches,
                    &mut fetch_rx,
                    &mut tracker_handle,
                )
                .await;
                break;
            }

            // One-shot replications end once the feed finished and the
            // pipeline drained
            if !self.options.continuous
                && tracker_done
                && state.http_connections == 0
                && state.queues_empty()
                && inbox.is_empty()
                && downloads.is_empty()
                && self.tasks.is_idle()
            {
                break;
            }

            // Tracker ended on a continuous run: retry, going offline first
            // for transport-class failures
            if tracker_done && self.options.continuous {
                let error = tracker_error.take();
                let offline_class = error.as_deref().map(is_offline_error).unwrap_or(false);
                if let Some(ref error) = error
                    && !offline_class
                {
                    consecutive_errors += 1;
                    if consecutive_errors >= constants::MAX_CONSECUTIVE_ERRORS {
                        self.runtime.trigger_fatal_shutdown();
                        self.teardown(
                            &mut state,
                            &mut stats,
                            &mut inbox,
                            &mut downloads,
                            &mut fetches,
                            &mut fetch_rx,
                            &mut tracker_handle,
                        )
                        .await;
                        self.publish_status(&state, false);
                        stats.total_duration = run_start.elapsed();
                        anyhow::bail!(
                            "giving up after {} consecutive errors: {}",
                            consecutive_errors,
                            error
                        );
                    }
                }

                let was_caught_up = state.caught_up;
                self.teardown(
                    &mut state,
                    &mut stats,
                    &mut inbox,
                    &mut downloads,
                    &mut fetches,
                    &mut fetch_rx,
                    &mut tracker_handle,
                )
                .await;

                if offline_class && state.online {
                    state.online = false;
                    self.handle_event(&PullEvent::WentOffline);
                    self.publish_status(&state, true);
                }

                let backoff_secs = 2u64
                    .pow(consecutive_errors.saturating_sub(1).min(8))
                    .min(constants::MAX_BACKOFF_SECS);
                if !self
                    .wait_before_retry(Duration::from_secs(backoff_secs), &mut online_rx)
                    .await
                {
                    break;
                }

                if !state.online {
                    state.online = true;
                    self.handle_event(&PullEvent::WentOnline);
                }
                let (rx, handle) = self.begin_replicating(&mut state, was_caught_up);
                tracker_rx = rx;
                tracker_handle = Some(handle);
                tracker_done = false;
                continue;
            }

            let incoming = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => Incoming::Shutdown,
                result = async { online_rx.as_mut().unwrap().changed().await }, if online_rx.is_some() => {
                    match result {
                        Ok(()) => Incoming::OnlineChanged,
                        Err(_) => {
                            // Reachability monitor went away; stop watching it
                            online_rx = None;
                            continue;
                        }
                    }
                }
                message = tracker_rx.recv(), if !tracker_done => match message {
                    Some(message) => Incoming::Tracker(message),
                    None => Incoming::TrackerClosed,
                },
                Some(message) = fetch_rx.recv() => Incoming::Fetch(message),
            };

            match incoming {
                Incoming::Shutdown => {
                    if self.runtime.is_shutdown() {
                        self.teardown(
                            &mut state,
                            &mut stats,
                            &mut inbox,
                            &mut downloads,
                            &mut fetches,
                            &mut fetch_rx,
                            &mut tracker_handle,
                        )
                        .await;
                        break;
                    }
                }
                Incoming::OnlineChanged => {
                    let now_online = online_rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(true);
                    if !now_online && state.online {
                        // Reachability lost: stop the feed and fetches, hold
                        // position at the current checkpoint
                        state.online = false;
                        self.handle_event(&PullEvent::WentOffline);
                        self.teardown(
                            &mut state,
                            &mut stats,
                            &mut inbox,
                            &mut downloads,
                            &mut fetches,
                            &mut fetch_rx,
                            &mut tracker_handle,
                        )
                        .await;
                        tracker_done = false;
                        if !self.wait_for_online(&mut online_rx).await {
                            break;
                        }
                        state.online = true;
                        self.handle_event(&PullEvent::WentOnline);
                        let was_caught_up = state.caught_up;
                        let (rx, handle) = self.begin_replicating(&mut state, was_caught_up);
                        tracker_rx = rx;
                        tracker_handle = Some(handle);
                    }
                }
                Incoming::Tracker(message) => {
                    // A live feed resets the error escalation
                    if matches!(
                        message,
                        TrackerMessage::Changes(_) | TrackerMessage::CaughtUp
                    ) {
                        consecutive_errors = 0;
                    }
                    self.handle_tracker_message(
                        &mut state,
                        message,
                        &mut inbox,
                        &mut tracker_done,
                        &mut tracker_error,
                    );
                    if tracker_done {
                        tracker_handle = None;
                    }
                }
                Incoming::TrackerClosed => {
                    // Channel dropped without a Stopped message (task aborted)
                    tracker_done = true;
                    tracker_handle = None;
                    if state.catch_up_task_open {
                        self.tasks.finished(1);
                        state.catch_up_task_open = false;
                    }
                    if state.tracker_task_open {
                        self.tasks.finished(1);
                        state.tracker_task_open = false;
                    }
                }
                Incoming::Fetch(message) => {
                    self.handle_fetch_message(
                        &mut state,
                        &mut stats,
                        message,
                        &mut downloads,
                        &mut fetches,
                        &fetch_tx,
                    );
                }
            }
        }

        self.publish_status(&state, false);
        stats.total_duration = run_start.elapsed();

        if let Some(error) = tracker_error
            && !self.options.continuous
        {
            anyhow::bail!("change feed stopped: {}", error);
        }
        Ok(stats)
    }

    fn handle_tracker_message(
        &self,
        state: &mut PullState,
        message: TrackerMessage,
        inbox: &mut Batcher<PulledRevision>,
        tracker_done: &mut bool,
        tracker_error: &mut Option<String>,
    ) {
        match message {
            TrackerMessage::Changes(entries) => {
                for entry in &entries {
                    if !self.store.is_valid_document_id(&entry.id) {
                        log::warn!("skipping change with invalid document id {:?}", entry.id);
                        continue;
                    }
                    let revs = revisions_from_entry(entry);
                    state.changes_total += revs.len() as u64;
                    for rev in revs {
                        if let Some(batch) = inbox.push(rev) {
                            // Capacity flush; smaller batches wait for the
                            // next worker turn
                            self.process_inbox(state, batch);
                        }
                    }
                }
                self.publish_status(state, true);
            }
            TrackerMessage::CaughtUp => {
                if !state.caught_up {
                    state.caught_up = true;
                    if state.catch_up_task_open {
                        self.tasks.finished(1);
                        state.catch_up_task_open = false;
                    }
                    self.handle_event(&PullEvent::CaughtUp {
                        last_sequence: state.last_sequence.clone(),
                        pending: state.seq_map.pending_count(),
                    });
                    self.publish_status(state, true);
                }
            }
            TrackerMessage::Stopped(error) => {
                *tracker_done = true;
                if state.catch_up_task_open {
                    self.tasks.finished(1);
                    state.catch_up_task_open = false;
                }
                if state.tracker_task_open {
                    self.tasks.finished(1);
                    state.tracker_task_open = false;
                }
                if let Some(error) = error {
                    if !is_offline_error(&error) {
                        self.record_error(state, error.clone());
                    }
                    *tracker_error = Some(error);
                }
            }
        }
    }

    fn handle_fetch_message(
        &self,
        state: &mut PullState,
        stats: &mut PullStats,
        message: FetchMessage,
        downloads: &mut Batcher<PulledRevision>,
        fetches: &mut JoinSet<()>,
        fetch_tx: &mpsc::UnboundedSender<FetchMessage>,
    ) {
        match message {
            FetchMessage::SingleDone { mut rev, result } => {
                state.http_connections = state.http_connections.saturating_sub(1);
                match result {
                    Ok(document) => {
                        rev.properties = Some(document);
                        // The insert task opens before the fetch task closes
                        // so the pipeline never looks idle in between
                        self.tasks.started();
                        self.tasks.finished(1);
                        if let Some(batch) = downloads.push(rev) {
                            self.insert_downloads(state, stats, batch);
                        }
                    }
                    Err(error) => {
                        self.record_error(
                            state,
                            format!("fetch of {} {} failed: {}", rev.doc_id, rev.rev_id, error),
                        );
                        // Progress is counted, but the sequence stays pending
                        // so a later run refetches it
                        state.changes_processed += 1;
                        self.tasks.finished(1);
                        self.publish_status(state, true);
                    }
                }
            }
            FetchMessage::BulkDone {
                mut remaining,
                result,
            } => {
                state.http_connections = state.http_connections.saturating_sub(1);
                match result {
                    Ok(rows) => {
                        self.accept_bulk_rows(state, stats, &mut remaining, rows, downloads);
                        // Misses and attachment-bearing rows go down the
                        // individual path
                        for rev in remaining {
                            state.revs.push_back(rev);
                        }
                        self.tasks.finished(1);
                    }
                    Err(error) => {
                        let count = remaining.len() as u64;
                        self.record_error(state, format!("bulk fetch failed: {}", error));
                        state.changes_processed += count;
                        self.tasks.finished(1);
                        self.publish_status(state, true);
                    }
                }
            }
        }
        self.pull_remote_revisions(state, fetches, fetch_tx);
    }

    fn accept_bulk_rows(
        &self,
        state: &mut PullState,
        stats: &mut PullStats,
        remaining: &mut Vec<PulledRevision>,
        rows: Vec<BulkRow>,
        downloads: &mut Batcher<PulledRevision>,
    ) {
        for row in rows {
            let Some(id) = row.id else { continue };
            let Some(document) = row.doc else { continue };
            // Bulk rows cannot carry attachment bodies; refetch individually
            if document.get("_attachments").is_some() {
                continue;
            }
            let Some(rev_id) = document.get("_rev").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(position) = remaining
                .iter()
                .position(|rev| rev.doc_id == id && rev.rev_id == rev_id)
            {
                let mut rev = remaining.remove(position);
                rev.properties = Some(document);
                self.tasks.started();
                if let Some(batch) = downloads.push(rev) {
                    self.insert_downloads(state, stats, batch);
                }
            }
        }
    }

    /// Wait out the retry backoff; an online signal ends it early.
    /// Returns false when shutdown fired instead.
    async fn wait_before_retry(
        &self,
        delay: Duration,
        online_rx: &mut Option<watch::Receiver<bool>>,
    ) -> bool {
        let mut shutdown_rx = self.runtime.shutdown_signal();
        if self.runtime.is_shutdown() {
            return false;
        }
        log::debug!("retrying in {:?}", delay);
        match online_rx {
            Some(rx) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = shutdown_rx.changed() => !self.runtime.is_shutdown(),
                    result = rx.wait_for(|online| *online) => result.is_ok(),
                }
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = shutdown_rx.changed() => !self.runtime.is_shutdown(),
                }
            }
        }
    }

    /// Block until reachability returns. Returns false on shutdown.
    async fn wait_for_online(&self, online_rx: &mut Option<watch::Receiver<bool>>) -> bool {
        let Some(rx) = online_rx else { return true };
        let mut shutdown_rx = self.runtime.shutdown_signal();
        tokio::select! {
            result = rx.wait_for(|online| *online) => result.is_ok(),
            _ = shutdown_rx.changed() => !self.runtime.is_shutdown(),
        }
    }
}
