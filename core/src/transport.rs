//! The network engine behind the session.
//!
//! # Design
//! A `Transport` executes one prepared request on an I/O worker thread and
//! reports what happens through `TaskEvents`: redirect proposals (answered
//! synchronously), the final response head, then body chunks in read order.
//! Completion is the return value. Cancellation is cooperative: the transport
//! polls `TaskEvents::is_cancelled` between network operations and stops with
//! `TransportError::Cancelled`.
//!
//! `UreqTransport` is the production engine. It shares one pooled
//! `ureq::Agent` across every task and handles redirects itself (the agent
//! never follows them) so each hop can be put to the task's delegate.
//! Each phase of an attempt (connect, send, response head, body) is bounded
//! by the request timeout, so a peer that stalls mid-body fails with
//! `TimedOut` instead of holding the worker until the resource deadline. A
//! cancel lands at the next chunk boundary or when that bound fires.

use std::io::Read;
use std::time::{Duration, Instant};

use url::Url;

use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::http::{HttpMethod, HttpRequest, ResponseHead};

/// Sink for the events of one running task.
pub trait TaskEvents {
    fn is_cancelled(&self) -> bool;

    /// Ask whether the redirect to `new_url` may be followed. Blocks until
    /// the task's delegate answers or the session gives up waiting.
    fn propose_redirect(&self, response: &ResponseHead, new_url: &Url) -> bool;

    /// The response whose body follows. Reported once per task.
    fn response(&self, head: ResponseHead);

    fn data(&self, chunk: Vec<u8>);
}

/// Executes HTTP requests for the session.
pub trait Transport: Send + Sync + 'static {
    fn execute(&self, request: HttpRequest, events: &dyn TaskEvents) -> Result<(), TransportError>;
}

/// Build the request for the next hop of a redirect, or `None` when the
/// response carries no usable `Location`.
///
/// 303 switches to GET (HEAD stays HEAD), as do 301/302 answering a POST.
/// 307/308 replay the method and body. Credentials are not carried to
/// another origin.
pub fn redirect_target(current: &HttpRequest, response: &ResponseHead) -> Option<HttpRequest> {
    if !response.is_redirect() {
        return None;
    }
    let location = response.header("location")?;
    let url = current.url.join(location).ok()?;

    let mut next = current.clone();
    let switch_to_get = match response.status {
        303 => current.method != HttpMethod::Head,
        301 | 302 => current.method == HttpMethod::Post,
        _ => false,
    };
    if switch_to_get {
        next.method = HttpMethod::Get;
        next.body = None;
        next.headers.retain(|(k, _)| {
            !k.eq_ignore_ascii_case("content-type") && !k.eq_ignore_ascii_case("content-length")
        });
    }
    if url.origin() != current.url.origin() {
        next.headers.retain(|(k, _)| {
            !k.eq_ignore_ascii_case("authorization") && !k.eq_ignore_ascii_case("cookie")
        });
    }
    next.url = url;
    Some(next)
}

/// Blocking transport over a shared, connection-pooling `ureq::Agent`.
pub struct UreqTransport {
    agent: ureq::Agent,
    chunk_size: usize,
    max_redirects: u32,
    resource_timeout: Duration,
}

impl UreqTransport {
    pub fn new(config: &SessionConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .max_redirects(0)
            .max_redirects_will_error(false)
            .timeout_global(Some(config.resource_timeout))
            .build()
            .new_agent();
        Self {
            agent,
            chunk_size: config.chunk_size,
            max_redirects: config.max_redirects,
            resource_timeout: config.resource_timeout,
        }
    }

    /// Send one hop. `remaining` is what is left of the resource deadline.
    fn send(
        &self,
        request: &HttpRequest,
        remaining: Duration,
    ) -> Result<ureq::http::Response<ureq::Body>, TransportError> {
        let mut builder = ureq::http::Request::builder()
            .method(request.method.as_str())
            .uri(request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let attempt = request.timeout.min(remaining);

        match &request.body {
            Some(body) => {
                let req = builder
                    .body(body.clone())
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                self.run(req, attempt, remaining)
            }
            None => {
                let req = builder
                    .body(())
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                self.run(req, attempt, remaining)
            }
        }
    }

    /// Every phase of one attempt, body transfer included, is bounded by
    /// `attempt`; the whole exchange by `remaining`.
    fn run<B: ureq::AsSendBody>(
        &self,
        request: ureq::http::Request<B>,
        attempt: Duration,
        remaining: Duration,
    ) -> Result<ureq::http::Response<ureq::Body>, TransportError> {
        let request = self
            .agent
            .configure_request(request)
            .timeout_connect(Some(attempt))
            .timeout_send_request(Some(attempt))
            .timeout_send_body(Some(attempt))
            .timeout_recv_response(Some(attempt))
            .timeout_recv_body(Some(attempt))
            .timeout_global(Some(remaining))
            .build();
        Ok(self.agent.run(request)?)
    }
}

impl Transport for UreqTransport {
    fn execute(&self, request: HttpRequest, events: &dyn TaskEvents) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.resource_timeout;
        let mut current = request;
        let mut hops = 0u32;

        loop {
            if events.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::TimedOut);
            }

            let mut response = self.send(&current, remaining)?;
            let head = ResponseHead {
                status: response.status().as_u16(),
                url: current.url.clone(),
                headers: response
                    .headers()
                    .iter()
                    .map(|(k, v)| {
                        (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned())
                    })
                    .collect(),
            };

            if let Some(next) = redirect_target(&current, &head) {
                if events.propose_redirect(&head, &next.url) {
                    if hops >= self.max_redirects {
                        return Err(TransportError::TooManyRedirects);
                    }
                    tracing::debug!(
                        from = %current.url,
                        to = %next.url,
                        status = head.status,
                        "following redirect"
                    );
                    hops += 1;
                    current = next;
                    continue;
                }
            }

            events.response(head);

            let mut reader = response.body_mut().as_reader();
            let mut buf = vec![0u8; self.chunk_size];
            loop {
                if events.is_cancelled() {
                    return Err(TransportError::Cancelled);
                }
                if Instant::now() >= deadline {
                    return Err(TransportError::TimedOut);
                }
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                events.data(buf[..n].to_vec());
            }
        }
    }
}
