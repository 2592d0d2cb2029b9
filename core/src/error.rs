//! Error types for clients and the shared session.
//!
//! # Design
//! Configuration problems surface from `Client::build` as `BuildError` and
//! never mid-flight. Everything the network does wrong is a `TransportError`,
//! handed by value to the failing client's delegate only. Errors are `Clone`
//! so a single failure can be logged and delivered without re-wrapping.
//! Explicit cancellation is not an error at all: it produces no callback.

/// Errors returned by `Client::build`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// The builder closure never set a URL.
    #[error("request URL is required")]
    MissingUrl,

    /// The builder closure never set an HTTP method.
    #[error("HTTP method is required")]
    MissingMethod,

    /// The URL could not be parsed.
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
}

/// Failures reported by the transport for a running task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The session declined to schedule the request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A request attempt or the whole transfer ran past its deadline.
    #[error("request timed out")]
    TimedOut,

    /// The redirect chain exceeded the session's limit.
    #[error("too many redirects")]
    TooManyRedirects,

    /// The transport stopped the task without a caller asking for it.
    #[error("task cancelled by transport")]
    Cancelled,

    /// Reading or writing the connection failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// Any other protocol or connection failure.
    #[error("network error: {0}")]
    Network(String),
}

impl From<ureq::Error> for TransportError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Timeout(_) => TransportError::TimedOut,
            ureq::Error::Io(io) => TransportError::from(io),
            other => TransportError::Network(other.to_string()),
        }
    }
}

/// Body reads surface ureq's own errors wrapped in `io::Error`; a socket
/// read timeout shows up as `WouldBlock` on some platforms.
impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        let inner = e.get_ref().and_then(|inner| inner.downcast_ref::<ureq::Error>());
        if let Some(ureq::Error::Timeout(_)) = inner {
            return TransportError::TimedOut;
        }
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::TimedOut
            }
            _ => TransportError::Io(e.to_string()),
        }
    }
}

/// Errors from configuring the shared session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `SessionManager::configure` was called after the shared instance
    /// had already been created.
    #[error("shared session is already initialized")]
    AlreadyInitialized,
}
