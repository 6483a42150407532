use crate::constants;
use crate::revision::RemoteSequence;
use std::time::Duration;
use tokio::sync::watch;

/// Credentials attached to outgoing requests. Authentication protocols beyond
/// header attachment are out of scope.
#[derive(Debug, Clone)]
pub enum Authorizer {
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// Configuration for a pull replication.
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Base URL of the remote replica (database root)
    pub remote_url: String,
    /// Keep pulling after catch-up via long-poll
    pub continuous: bool,
    /// Long-poll heartbeat in milliseconds; ignored below 15000
    pub heartbeat_ms: Option<u64>,
    /// Server-side change-feed filter
    pub filter_name: Option<String>,
    pub filter_params: Vec<(String, String)>,
    /// Restrict the change feed to these documents
    pub doc_ids: Vec<String>,
    /// Merged over the default User-Agent header
    pub request_headers: Vec<(String, String)>,
    pub authorizer: Option<Authorizer>,
    /// Trust policy for the remote's TLS certificate
    pub accept_invalid_certs: bool,
    /// Checkpoint to resume from
    pub last_sequence: Option<RemoteSequence>,
    /// External stop signal; replication also stops when the sender drops
    pub shutdown_rx: Option<watch::Receiver<bool>>,
    /// External reachability signal driving online/offline transitions
    pub online_rx: Option<watch::Receiver<bool>>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            continuous: false,
            heartbeat_ms: None,
            filter_name: None,
            filter_params: Vec::new(),
            doc_ids: Vec::new(),
            request_headers: Vec::new(),
            authorizer: None,
            accept_invalid_certs: false,
            last_sequence: None,
            shutdown_rx: None,
            online_rx: None,
        }
    }
}

impl PullOptions {
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            remote_url: remote_url.into(),
            ..Self::default()
        }
    }

    /// Heartbeat actually sent to the change feed: configured values under
    /// the 15 second floor are ignored.
    pub fn effective_heartbeat(&self) -> Option<Duration> {
        match self.heartbeat_ms {
            Some(ms) if ms >= constants::MIN_HEARTBEAT_MS => Some(Duration::from_millis(ms)),
            _ => None,
        }
    }
}

/// Builder for PullOptions
pub struct PullOptionsBuilder {
    options: PullOptions,
}

impl PullOptionsBuilder {
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            options: PullOptions::new(remote_url),
        }
    }

    pub fn continuous(mut self, continuous: bool) -> Self {
        self.options.continuous = continuous;
        self
    }

    pub fn heartbeat_ms(mut self, ms: u64) -> Self {
        self.options.heartbeat_ms = Some(ms);
        self
    }

    pub fn filter(mut self, name: impl Into<String>, params: Vec<(String, String)>) -> Self {
        self.options.filter_name = Some(name.into());
        self.options.filter_params = params;
        self
    }

    pub fn doc_ids(mut self, ids: Vec<String>) -> Self {
        self.options.doc_ids = ids;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.request_headers.push((name.into(), value.into()));
        self
    }

    pub fn authorizer(mut self, authorizer: Authorizer) -> Self {
        self.options.authorizer = Some(authorizer);
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.options.accept_invalid_certs = accept;
        self
    }

    pub fn last_sequence(mut self, seq: RemoteSequence) -> Self {
        self.options.last_sequence = Some(seq);
        self
    }

    pub fn shutdown_rx(mut self, rx: watch::Receiver<bool>) -> Self {
        self.options.shutdown_rx = Some(rx);
        self
    }

    pub fn online_rx(mut self, rx: watch::Receiver<bool>) -> Self {
        self.options.online_rx = Some(rx);
        self
    }

    pub fn build(self) -> PullOptions {
        self.options
    }
}
