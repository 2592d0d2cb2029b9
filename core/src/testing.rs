//! Scripted transport for unit tests.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use url::Url;

use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::http::{HttpRequest, ResponseHead};
use crate::session::SessionManager;
use crate::transport::{TaskEvents, Transport};

type Script = dyn Fn(HttpRequest, &dyn TaskEvents) -> Result<(), TransportError> + Send + Sync;

/// Transport driven by a closure instead of the network.
pub struct FnTransport {
    script: Box<Script>,
    calls: Arc<AtomicUsize>,
}

impl FnTransport {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(HttpRequest, &dyn TaskEvents) -> Result<(), TransportError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of `execute` calls, readable after the transport is moved
    /// into a session.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Transport for FnTransport {
    fn execute(&self, request: HttpRequest, events: &dyn TaskEvents) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(request, events)
    }
}

/// A session over `transport` that lives for the rest of the test binary.
pub fn leak_session(transport: FnTransport) -> &'static SessionManager {
    leak_session_with(SessionConfig::default(), Arc::new(transport))
}

pub fn leak_session_with(
    config: SessionConfig,
    transport: Arc<dyn Transport>,
) -> &'static SessionManager {
    let session = SessionManager::with_transport(config, transport).expect("test session");
    Box::leak(Box::new(session))
}

/// Start the mock server on a random port; returns its base URL.
pub fn start_mock_server() -> String {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = std_listener.local_addr().expect("local addr");
    std_listener.set_nonblocking(true).expect("nonblocking");

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("mock server runtime");
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).expect("listener");
            mock_server::run(listener).await
        })
        .expect("mock server");
    });

    format!("http://{addr}")
}

/// A raw TCP peer that reads one request, writes `reply` and then holds the
/// connection open without sending anything else.
pub fn stalling_peer(reply: &'static str) -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");

    std::thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut buf = [0u8; 4096];
        let mut seen = Vec::new();
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => seen.extend_from_slice(&buf[..n]),
            }
        }
        let _ = stream.write_all(reply.as_bytes());
        let _ = stream.flush();
        std::thread::sleep(Duration::from_secs(30));
    });

    format!("http://{addr}")
}

/// `TaskEvents` that records what the transport reports and answers every
/// redirect proposal with `allow_redirect`.
pub struct RecordingEvents {
    allow_redirect: bool,
    pub proposals: Mutex<Vec<Url>>,
    pub heads: Mutex<Vec<ResponseHead>>,
    pub body: Mutex<Vec<u8>>,
}

impl RecordingEvents {
    pub fn new(allow_redirect: bool) -> Self {
        Self {
            allow_redirect,
            proposals: Mutex::new(Vec::new()),
            heads: Mutex::new(Vec::new()),
            body: Mutex::new(Vec::new()),
        }
    }
}

impl TaskEvents for RecordingEvents {
    fn is_cancelled(&self) -> bool {
        false
    }

    fn propose_redirect(&self, _response: &ResponseHead, new_url: &Url) -> bool {
        self.proposals.lock().push(new_url.clone());
        self.allow_redirect
    }

    fn response(&self, head: ResponseHead) {
        self.heads.lock().push(head);
    }

    fn data(&self, chunk: Vec<u8>) {
        self.body.lock().extend_from_slice(&chunk);
    }
}

/// Report a final response with `chunks` as its body.
pub fn respond(events: &dyn TaskEvents, status: u16, chunks: &[&str]) {
    events.response(head(status, Vec::new()));
    for chunk in chunks {
        events.data(chunk.as_bytes().to_vec());
    }
}

pub fn head(status: u16, headers: Vec<(String, String)>) -> ResponseHead {
    ResponseHead {
        status,
        url: Url::parse("http://scripted.test/").expect("static url"),
        headers,
    }
}
