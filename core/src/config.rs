//! Session configuration.

use std::time::Duration;

/// Per-attempt timeout applied when a client does not ask for more.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Ceiling for a whole transfer, redirects and body included.
pub const DEFAULT_RESOURCE_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Settings for a `SessionManager`.
///
/// The shared instance uses `SessionConfig::default()` unless
/// `SessionManager::configure` runs before first use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub request_timeout: Duration,
    pub resource_timeout: Duration,
    /// Upper bound on threads blocked in network I/O at once.
    pub max_io_threads: usize,
    /// Read buffer size; each filled buffer is forwarded as one data event.
    pub chunk_size: usize,
    pub max_redirects: u32,
    /// How long an I/O worker waits for a delegate's redirect decision.
    pub redirect_decision_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            resource_timeout: DEFAULT_RESOURCE_TIMEOUT,
            max_io_threads: 64,
            chunk_size: 16 * 1024,
            max_redirects: 16,
            redirect_decision_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn resource_timeout(mut self, timeout: Duration) -> Self {
        self.resource_timeout = timeout;
        self
    }

    pub fn max_io_threads(mut self, threads: usize) -> Self {
        self.max_io_threads = threads.max(1);
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn max_redirects(mut self, redirects: u32) -> Self {
        self.max_redirects = redirects;
        self
    }

    pub fn redirect_decision_timeout(mut self, timeout: Duration) -> Self {
        self.redirect_decision_timeout = timeout;
        self
    }

    /// Effective per-attempt timeout for a client asking for `requested`.
    /// Requests can only raise the session default, never lower it.
    pub fn effective_request_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if t > self.request_timeout => t,
            _ => self.request_timeout,
        }
    }
}
