use anyhow::Result;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use revpull::revision::PulledRevision;
use revpull::store::{InsertOutcome, ReplicaStore, TransactionResult};

// ============================================================================
// Mock remote replica
// ============================================================================

pub struct ChangeSpec {
    pub id: String,
    pub revs: Vec<String>,
    pub deleted: bool,
}

/// Scripted CouchDB-style remote with request accounting, served over axum.
#[derive(Default)]
pub struct MockReplica {
    pub entries: Mutex<Vec<ChangeSpec>>,
    /// (doc id, rev id) -> body
    pub docs: Mutex<HashMap<(String, String), Value>>,
    /// doc id -> current winning rev id
    pub current: Mutex<HashMap<String, String>>,
    /// Docs whose bulk rows carry an `_attachments` stub
    pub bulk_attachment_docs: Mutex<HashSet<String>>,
    /// Docs served without `_revisions`
    pub no_history_docs: Mutex<HashSet<String>>,
    /// Per-doc artificial latency on individual GETs (ms)
    pub doc_delays: Mutex<HashMap<String, u64>>,
    /// Docs whose individual GET returns a 500
    pub failing_docs: Mutex<HashSet<String>>,

    pub changes_requests: AtomicUsize,
    /// Key list of every bulk POST received
    pub bulk_requests: Mutex<Vec<Vec<String>>>,
    /// (doc id, rev id, atts_since) of every individual GET received
    pub doc_requests: Mutex<Vec<(String, String, Option<String>)>>,
    active_fetches: AtomicUsize,
    pub max_active_fetches: AtomicUsize,
}

impl MockReplica {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script one change entry; bodies for every leaf are derived and stored.
    pub fn add_change(&self, id: &str, revs: &[&str], deleted: bool) {
        let mut docs = self.docs.lock().unwrap();
        for rev in revs {
            docs.insert((id.to_string(), rev.to_string()), self.make_body(id, rev, deleted));
        }
        self.current
            .lock()
            .unwrap()
            .insert(id.to_string(), revs[0].to_string());
        self.entries.lock().unwrap().push(ChangeSpec {
            id: id.to_string(),
            revs: revs.iter().map(|r| r.to_string()).collect(),
            deleted,
        });
    }

    fn make_body(&self, id: &str, rev: &str, deleted: bool) -> Value {
        let mut body = json!({
            "_id": id,
            "_rev": rev,
            "value": format!("content of {} at {}", id, rev),
        });
        if deleted {
            body["_deleted"] = json!(true);
        }
        if !self.no_history_docs.lock().unwrap().contains(id) {
            let (generation, suffix) = rev.split_once('-').expect("well-formed rev id");
            let generation: u64 = generation.parse().unwrap();
            body["_revisions"] = json!({ "start": generation, "ids": [suffix] });
        }
        body
    }

    pub fn total_fetch_requests(&self) -> usize {
        self.bulk_requests.lock().unwrap().len() + self.doc_requests.lock().unwrap().len()
    }
}

async fn handle_changes(
    State(replica): State<Arc<MockReplica>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    replica.changes_requests.fetch_add(1, Ordering::SeqCst);

    let since: u64 = params
        .get("since")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let limit: usize = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);
    let longpoll = params.get("feed").map(|f| f == "longpoll").unwrap_or(false);

    let results = collect_changes(&replica, since, limit);
    if longpoll && results.is_empty() {
        // A real long poll hangs until a change arrives; the mock just waits
        // a beat and retries once so continuous tests can inject entries
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let results = if results.is_empty() {
        collect_changes(&replica, since, limit)
    } else {
        results
    };

    let last_seq = results
        .last()
        .and_then(|r| r.get("seq").and_then(|s| s.as_u64()))
        .unwrap_or(since);
    axum::Json(json!({ "results": results, "last_seq": last_seq })).into_response()
}

fn collect_changes(replica: &MockReplica, since: u64, limit: usize) -> Vec<Value> {
    let entries = replica.entries.lock().unwrap();
    entries
        .iter()
        .enumerate()
        .filter(|(i, _)| (*i as u64 + 1) > since)
        .take(limit)
        .map(|(i, spec)| {
            json!({
                "seq": i as u64 + 1,
                "id": spec.id,
                "deleted": spec.deleted,
                "changes": spec.revs.iter().map(|r| json!({"rev": r})).collect::<Vec<_>>(),
            })
        })
        .collect()
}

async fn handle_doc(
    State(replica): State<Arc<MockReplica>>,
    Path(doc_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let active = replica.active_fetches.fetch_add(1, Ordering::SeqCst) + 1;
    replica
        .max_active_fetches
        .fetch_max(active, Ordering::SeqCst);

    let rev = params.get("rev").cloned().unwrap_or_default();
    replica.doc_requests.lock().unwrap().push((
        doc_id.clone(),
        rev.clone(),
        params.get("atts_since").cloned(),
    ));

    let delay = replica
        .doc_delays
        .lock()
        .unwrap()
        .get(&doc_id)
        .copied()
        .unwrap_or(5);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    let response = if replica.failing_docs.lock().unwrap().contains(&doc_id) {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"error": "internal_server_error"})),
        )
            .into_response()
    } else {
        match replica
            .docs
            .lock()
            .unwrap()
            .get(&(doc_id.clone(), rev.clone()))
        {
            Some(body) => axum::Json(body.clone()).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                axum::Json(json!({"error": "not_found"})),
            )
                .into_response(),
        }
    };

    replica.active_fetches.fetch_sub(1, Ordering::SeqCst);
    response
}

async fn handle_bulk(
    State(replica): State<Arc<MockReplica>>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let active = replica.active_fetches.fetch_add(1, Ordering::SeqCst) + 1;
    replica
        .max_active_fetches
        .fetch_max(active, Ordering::SeqCst);

    let keys: Vec<String> = body
        .get("keys")
        .and_then(|k| k.as_array())
        .map(|keys| {
            keys.iter()
                .filter_map(|k| k.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    replica.bulk_requests.lock().unwrap().push(keys.clone());

    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut rows = Vec::new();
    {
        let current = replica.current.lock().unwrap();
        let docs = replica.docs.lock().unwrap();
        let with_attachments = replica.bulk_attachment_docs.lock().unwrap();
        for key in keys {
            let row = match current
                .get(&key)
                .and_then(|rev| docs.get(&(key.clone(), rev.clone())))
            {
                Some(doc) => {
                    let mut doc = doc.clone();
                    // Bulk rows never include _revisions, and attachment
                    // stubs force the individual path
                    if let Some(map) = doc.as_object_mut() {
                        map.remove("_revisions");
                    }
                    if with_attachments.contains(&key) {
                        doc["_attachments"] = json!({"img.png": {"stub": true}});
                    }
                    json!({"id": key, "key": key, "value": {"rev": doc["_rev"]}, "doc": doc})
                }
                None => json!({"key": key, "error": "not_found"}),
            };
            rows.push(row);
        }
    }

    replica.active_fetches.fetch_sub(1, Ordering::SeqCst);
    axum::Json(json!({ "rows": rows })).into_response()
}

/// Serve the mock replica on an ephemeral port; returns its database URL.
pub async fn start_mock_replica(replica: Arc<MockReplica>) -> Result<String> {
    let app = Router::new()
        .route("/db/_changes", get(handle_changes))
        .route("/db/_all_docs", post(handle_bulk))
        .route("/db/{doc_id}", get(handle_doc))
        .with_state(replica);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Ok(format!("http://{}/db", addr))
}

// ============================================================================
// In-memory replica store
// ============================================================================

/// Minimal local store good enough to exercise the pull pipeline.
#[derive(Default)]
pub struct MemoryStore {
    /// doc id -> rev ids known locally (insertion order)
    revs: Mutex<HashMap<String, Vec<String>>>,
    bodies: Mutex<HashMap<(String, String), Value>>,
    /// Doc ids rejected by validation
    pub forbidden_docs: Mutex<HashSet<String>>,
    /// Next N inserts report Busy before succeeding
    pub busy_next: Mutex<usize>,
    /// Local docs that carry attachments
    pub attachment_docs: Mutex<HashSet<String>>,
    /// Every successful insert, in commit order
    pub insert_log: Mutex<Vec<(String, String)>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, doc_id: &str, rev_ids: &[&str]) {
        let mut revs = self.revs.lock().unwrap();
        let entry = revs.entry(doc_id.to_string()).or_default();
        for rev in rev_ids {
            entry.push(rev.to_string());
        }
    }

    pub fn contains(&self, doc_id: &str, rev_id: &str) -> bool {
        self.revs
            .lock()
            .unwrap()
            .get(doc_id)
            .map(|revs| revs.iter().any(|r| r == rev_id))
            .unwrap_or(false)
    }

    pub fn insert_count(&self) -> usize {
        self.insert_log.lock().unwrap().len()
    }
}

impl ReplicaStore for MemoryStore {
    fn find_missing_revisions(&self, revs: &mut Vec<PulledRevision>) -> anyhow::Result<()> {
        revs.retain(|rev| !self.contains(&rev.doc_id, &rev.rev_id));
        Ok(())
    }

    fn possible_ancestor_ids(&self, rev: &PulledRevision, limit: usize) -> (Vec<String>, bool) {
        let known = self.revs.lock().unwrap();
        let mut ancestors: Vec<String> = known
            .get(&rev.doc_id)
            .map(|revs| revs.iter().rev().cloned().collect())
            .unwrap_or_default();
        ancestors.truncate(limit);
        let has_attachments = self
            .attachment_docs
            .lock()
            .unwrap()
            .contains(&rev.doc_id);
        (ancestors, has_attachments)
    }

    fn in_transaction(&self, block: &mut dyn FnMut() -> TransactionResult) -> anyhow::Result<()> {
        for _ in 0..16 {
            if block() == TransactionResult::Commit {
                return Ok(());
            }
        }
        anyhow::bail!("transaction kept reporting busy")
    }

    fn force_insert(&self, rev: &PulledRevision, history: &[String], _source: &str) -> InsertOutcome {
        {
            let mut busy = self.busy_next.lock().unwrap();
            if *busy > 0 {
                *busy -= 1;
                return InsertOutcome::Busy;
            }
        }
        if self.forbidden_docs.lock().unwrap().contains(&rev.doc_id) {
            return InsertOutcome::Forbidden;
        }
        if history.is_empty() {
            return InsertOutcome::Failed("empty revision history".into());
        }

        let mut revs = self.revs.lock().unwrap();
        let entry = revs.entry(rev.doc_id.clone()).or_default();
        if !entry.iter().any(|r| r == &rev.rev_id) {
            entry.push(rev.rev_id.clone());
        }
        if let Some(props) = &rev.properties {
            self.bodies
                .lock()
                .unwrap()
                .insert((rev.doc_id.clone(), rev.rev_id.clone()), props.clone());
        }
        self.insert_log
            .lock()
            .unwrap()
            .push((rev.doc_id.clone(), rev.rev_id.clone()));
        InsertOutcome::Inserted
    }
}
