//! Per-request HTTP clients over one shared, pooled session.
//!
//! # Overview
//! A [`Client`] is configured once through [`Client::build`], runs exactly
//! one request and reports the outcome to a [`ClientDelegate`]. All clients
//! share the process-wide [`SessionManager`], which owns the transport and
//! forwards transport events back to whichever client started the task.
//!
//! # Design
//! - Callbacks never run on the caller's thread: every delegate method is
//!   invoked on the session's single dispatch thread.
//! - Nothing retains a delegate. The session holds clients weakly and
//!   clients hold their delegates weakly; events for a vanished receiver
//!   are dropped.
//! - `Client::cancel_request` guarantees silence: once it takes effect no
//!   success or failure callback fires, even for an already queued event.
//! - The network engine sits behind the [`Transport`] trait; the default is
//!   a shared `ureq` agent.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{Client, ClientBuilder, ClientDelegate, ClientState};
pub use config::SessionConfig;
pub use error::{BuildError, ConfigError, TransportError};
pub use http::{CachePolicy, Headers, HttpMethod, HttpRequest, HttpResponse, ResponseHead};
pub use session::{DataTask, SessionDelegate, SessionManager, TaskId};
pub use transport::{TaskEvents, Transport, UreqTransport};
