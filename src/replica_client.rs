//! HTTP client for the remote replica: change feed, individual revision GETs,
//! and bulk document POSTs, with 429/Retry-After handling and retries/backoff
//! on the change feed.

// src/replica_client.rs
use crate::changes::{ChangeFeedMode, ChangesPage, ChangesQuery};
use crate::constants;
use crate::options::{Authorizer, PullOptions};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One row of a `_all_docs?include_docs=true` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub doc: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    rows: Vec<BulkRow>,
}

/// HTTP client for a CouchDB-style remote replica.
#[derive(Clone)]
pub struct ReplicaClient {
    client: reqwest::Client,
    base_url: String,
    request_headers: Vec<(String, String)>,
    authorizer: Option<Authorizer>,
    last_retry_after: Arc<tokio::sync::Mutex<Option<Duration>>>,
}

impl ReplicaClient {
    pub fn new(options: &PullOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            base_url: options.remote_url.trim_end_matches('/').to_string(),
            request_headers: options.request_headers.clone(),
            authorizer: options.authorizer.clone(),
            last_retry_after: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request.header("User-Agent", constants::user_agent());
        for (name, value) in &self.request_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        match &self.authorizer {
            Some(Authorizer::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(Authorizer::Bearer { token }) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Fetch one page of the change feed, retrying transient failures with
    /// backoff and honoring Retry-After. Cancelable via `shutdown_rx`.
    pub async fn fetch_changes(
        &self,
        query: &ChangesQuery,
        shutdown_rx: Option<watch::Receiver<bool>>,
    ) -> Result<ChangesPage> {
        let mut backoff = Duration::from_secs(1);
        let mut last_err = None;

        for attempt in 1..=constants::CHANGES_MAX_RETRIES {
            if let Some(ref rx) = shutdown_rx
                && *rx.borrow()
            {
                anyhow::bail!("Shutdown requested");
            }

            *self.last_retry_after.lock().await = None;

            match self.do_fetch_changes(query).await {
                Ok(page) => return Ok(page),
                Err(e) => {
                    last_err = Some(e);

                    // 429 takes precedence over the generic backoff
                    let wait = match self.last_retry_after.lock().await.take() {
                        Some(retry_after) => {
                            log::warn!(
                                "change feed rate limited, waiting {:?} before retry {}/{}",
                                retry_after,
                                attempt,
                                constants::CHANGES_MAX_RETRIES
                            );
                            retry_after
                        }
                        None => {
                            if attempt < constants::CHANGES_MAX_RETRIES {
                                log::debug!(
                                    "change feed request failed (attempt {}/{}): {}, retrying in {:?}",
                                    attempt,
                                    constants::CHANGES_MAX_RETRIES,
                                    last_err.as_ref().unwrap(),
                                    backoff
                                );
                            }
                            let wait = backoff;
                            backoff *= 2;
                            wait
                        }
                    };

                    if attempt < constants::CHANGES_MAX_RETRIES {
                        if let Some(mut rx) = shutdown_rx.clone() {
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = rx.changed() => {
                                    if *rx.borrow() { anyhow::bail!("Shutdown requested"); }
                                }
                            }
                        } else {
                            tokio::time::sleep(wait).await;
                        }
                    }
                }
            }
        }

        anyhow::bail!(
            "change feed failed after {} attempts: {}",
            constants::CHANGES_MAX_RETRIES,
            last_err.unwrap_or_else(|| anyhow::anyhow!("Unknown error"))
        )
    }

    async fn do_fetch_changes(&self, query: &ChangesQuery) -> Result<ChangesPage> {
        let url = format!("{}/_changes", self.base_url);
        let mut pairs: Vec<(String, String)> = vec![
            ("style".into(), "all_docs".into()),
            ("limit".into(), query.limit.to_string()),
        ];
        if let Some(ref since) = query.since {
            pairs.push(("since".into(), since.as_since_param()));
        }
        let timeout = match query.mode {
            ChangeFeedMode::OneShot => Duration::from_secs(constants::HTTP_TIMEOUT_SECS),
            ChangeFeedMode::LongPoll => {
                pairs.push(("feed".into(), "longpoll".into()));
                let heartbeat = match query.heartbeat {
                    Some(heartbeat) => {
                        pairs.push(("heartbeat".into(), heartbeat.as_millis().to_string()));
                        heartbeat
                    }
                    None => Duration::from_secs(constants::HTTP_TIMEOUT_SECS),
                };
                heartbeat + Duration::from_secs(constants::LONGPOLL_TIMEOUT_SLACK_SECS)
            }
        };
        if !query.doc_ids.is_empty() {
            pairs.push(("filter".into(), "_doc_ids".into()));
            pairs.push(("doc_ids".into(), serde_json::to_string(&query.doc_ids)?));
        } else if let Some(ref filter) = query.filter_name {
            pairs.push(("filter".into(), filter.clone()));
            for (name, value) in &query.filter_params {
                pairs.push((name.clone(), value.clone()));
            }
        }

        let response = self
            .apply_headers(self.client.get(&url))
            .query(&pairs)
            .timeout(timeout)
            .send()
            .await
            .context("change feed request failed")?;
        let body = self.check_and_read(response, "change feed").await?;

        let page: ChangesPage =
            sonic_rs::from_str(&body).context("failed to parse change feed response")?;
        Ok(page)
    }

    /// Fetch one revision with its history; `atts_since` carries local
    /// ancestor revision ids so the remote can skip attachment bodies the
    /// local replica already has.
    pub async fn fetch_revision(
        &self,
        doc_id: &str,
        rev_id: &str,
        atts_since: &[String],
    ) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, urlencoding::encode(doc_id));
        let mut pairs: Vec<(String, String)> = vec![
            ("rev".into(), rev_id.to_string()),
            ("revs".into(), "true".into()),
            ("attachments".into(), "true".into()),
        ];
        if !atts_since.is_empty() {
            pairs.push(("atts_since".into(), serde_json::to_string(atts_since)?));
        }

        let response = self
            .apply_headers(self.client.get(&url))
            .query(&pairs)
            .timeout(Duration::from_secs(constants::HTTP_TIMEOUT_SECS))
            .send()
            .await
            .context(format!("revision request failed for {}", doc_id))?;
        let body = self.check_and_read(response, "revision fetch").await?;

        let document: Value = serde_json::from_str(&body)
            .context(format!("failed to parse revision body for {}", doc_id))?;
        Ok(document)
    }

    /// Fetch current revisions of several documents in one POST.
    pub async fn bulk_fetch(&self, doc_ids: &[String]) -> Result<Vec<BulkRow>> {
        let url = format!("{}/_all_docs", self.base_url);
        let body = serde_json::json!({ "keys": doc_ids });

        let response = self
            .apply_headers(self.client.post(&url))
            .query(&[("include_docs", "true")])
            .json(&body)
            .timeout(Duration::from_secs(constants::HTTP_TIMEOUT_SECS))
            .send()
            .await
            .context("bulk fetch request failed")?;
        let body = self.check_and_read(response, "bulk fetch").await?;

        let parsed: BulkResponse =
            serde_json::from_str(&body).context("failed to parse bulk fetch response")?;
        Ok(parsed.rows)
    }

    async fn check_and_read(&self, response: reqwest::Response, what: &str) -> Result<String> {
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(&response);
            *self.last_retry_after.lock().await = Some(retry_after);
            anyhow::bail!("Rate limited (429)");
        }
        if !response.status().is_success() {
            anyhow::bail!("{} failed: {}", what, response.status());
        }
        Ok(response.text().await?)
    }
}

/// Parse the Retry-After header from a response, capped at 60 seconds
fn parse_retry_after(response: &reqwest::Response) -> Duration {
    let cap = Duration::from_secs(constants::MAX_RETRY_AFTER_SECS);

    if let Some(header) = response.headers().get("retry-after")
        && let Ok(value) = header.to_str()
    {
        if let Ok(seconds) = value.parse::<u64>() {
            return Duration::from_secs(seconds).min(cap);
        }
        if let Ok(http_time) = httpdate::parse_http_date(value)
            && let Ok(duration) = http_time.duration_since(std::time::SystemTime::now())
        {
            return duration.min(cap);
        }
    }

    cap
}

/// Classify an error as the transient transport kind that sends the
/// replicator offline rather than failing the run.
pub fn is_offline_error(error_msg: &str) -> bool {
    let error_lower = error_msg.to_lowercase();

    let offline_patterns = [
        "connection",
        "timeout",
        "timed out",
        "network",
        "unreachable",
        "dns",
        "broken pipe",
        "connection reset",
        "rate limited",
        "502",
        "503",
        "504",
        "shutdown requested",
    ];

    offline_patterns
        .iter()
        .any(|pattern| error_lower.contains(pattern))
}
