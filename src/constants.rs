// Constants for version and protocol identification

/// Library name used in user agents
pub const LIBRARY_NAME: &str = "revpull";

/// Package version from Cargo.toml (set at compile time)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the user agent string for HTTP requests
pub fn user_agent() -> String {
    format!("{}/{}", LIBRARY_NAME, VERSION)
}

// ============================================================================
// Change Feed Constants
// ============================================================================

/// Maximum number of change entries requested per change-feed response
pub const CHANGES_FEED_LIMIT: usize = 100;

/// Minimum accepted long-poll heartbeat; shorter values are ignored
pub const MIN_HEARTBEAT_MS: u64 = 15_000;

// ============================================================================
// Fetch Dispatch Constants
// ============================================================================

/// Maximum number of outstanding HTTP requests issued by the dispatcher
pub const MAX_OPEN_HTTP_CONNECTIONS: usize = 12;

/// Maximum number of revisions fetched in a single bulk POST
pub const MAX_REVS_TO_GET_IN_BULK: usize = 50;

/// Maximum number of ancestor revision ids sent in `atts_since`
pub const MAX_NUMBER_OF_ATTS_SINCE: usize = 50;

// ============================================================================
// Batching Constants
// ============================================================================

/// Capacity threshold at which the inbox and download batchers flush
pub const BATCHER_CAPACITY: usize = 200;

// ============================================================================
// Timeout and Retry Constants
// ============================================================================

/// Default HTTP request timeout (non long-poll requests)
pub const HTTP_TIMEOUT_SECS: u64 = 60;

/// Extra slack added on top of the heartbeat for long-poll request timeouts
pub const LONGPOLL_TIMEOUT_SLACK_SECS: u64 = 60;

/// Maximum wait honored from a 429 Retry-After header
pub const MAX_RETRY_AFTER_SECS: u64 = 60;

/// Maximum retry attempts for a single change-feed request
pub const CHANGES_MAX_RETRIES: usize = 5;

/// Cap on the exponential backoff between replication retries
pub const MAX_BACKOFF_SECS: u64 = 300;

/// Consecutive replication errors after which a continuous run gives up
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;
