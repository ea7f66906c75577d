//! MessageBus configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default number of log entries retained by the bus
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 1000;

/// Default request timeout in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// MessageBus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum number of messages kept in the audit log (oldest evicted first)
    #[serde(rename = "max-log-entries", default = "default_max_log_entries")]
    pub max_log_entries: usize,

    /// Default timeout for request/response in milliseconds
    #[serde(rename = "request-timeout-ms", default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_log_entries() -> usize {
    DEFAULT_MAX_LOG_ENTRIES
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl BusConfig {
    /// Get the default request timeout as a Duration
    pub fn request_timeout(&self) -> Duration {
        debug!(request_timeout_ms = %self.request_timeout_ms, "BusConfig::request_timeout: called");
        Duration::from_millis(self.request_timeout_ms)
    }
}
