//! Single-use HTTP client driven by a delegate.
//!
//! # Design
//! A `Client` carries one request from configuration to a terminal outcome:
//!
//! ```text
//! Unprepared --prepare_request--> Prepared --start_request--> Running
//! Prepared  --cancel_request--> Cancelled
//! Running   --cancel_request--> Cancelled
//! Running   --transport ok----> Succeeded
//! Running   --transport err---> Failed
//! ```
//!
//! Terminal states absorb: every operation on a finished client is a no-op.
//! State changes happen under the client's lock and the delegate is called
//! after the lock is released, so a delegate may call back into the client.
//! Whoever moves the state out of `Running` first decides the outcome, which
//! is how an explicit cancel suppresses a completion that is already queued.
//!
//! The client registers itself with the session as a weak delegate and holds
//! its own delegate weakly, so neither side keeps the other alive. Dropping
//! the last handle to a running client cancels its task.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use url::Url;

use crate::error::{BuildError, TransportError};
use crate::http::{CachePolicy, Headers, HttpMethod, HttpRequest, ResponseHead};
use crate::session::{DataTask, SessionDelegate, SessionManager, TaskId};

/// Receives the outcome of a client's request.
///
/// Every method is called on the session's dispatch thread. Exactly one of
/// `on_success` / `on_failure` is called per request, unless the request is
/// cancelled with [`Client::cancel_request`], in which case neither is.
pub trait ClientDelegate: Send + Sync {
    /// The transport finished. `status` may be any HTTP status, including
    /// 4xx/5xx and a 3xx whose redirect was rejected.
    fn on_success(&self, client: &Client, status: u16, headers: &Headers, body: Vec<u8>);

    fn on_failure(&self, client: &Client, error: TransportError);

    /// Allow or block a redirect. Only consulted when the client was not
    /// built with `block_redirect(true)`. Must return promptly.
    fn should_redirect(&self, client: &Client, new_url: &Url) -> bool {
        let _ = (client, new_url);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unprepared,
    Prepared,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ClientState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientState::Succeeded | ClientState::Failed | ClientState::Cancelled)
    }
}

/// Mutable view handed to the closure passed to [`Client::build`].
#[derive(Default)]
pub struct ClientBuilder {
    delegate: Option<Weak<dyn ClientDelegate>>,
    timeout: Option<Duration>,
    url: Option<String>,
    http_method: Option<HttpMethod>,
    headers: Headers,
    query_params: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    disable_caching: bool,
    block_redirect: bool,
    #[cfg(test)]
    session: Option<&'static SessionManager>,
}

impl ClientBuilder {
    /// The delegate is not retained by the client.
    pub fn delegate<D: ClientDelegate + 'static>(&mut self, delegate: &Arc<D>) -> &mut Self {
        let weak: Weak<dyn ClientDelegate> = Arc::downgrade(delegate) as Weak<dyn ClientDelegate>;
        self.delegate = Some(weak);
        self
    }

    /// Per-attempt timeout. Values below the session default are ignored.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn url(&mut self, url: impl Into<String>) -> &mut Self {
        self.url = Some(url.into());
        self
    }

    pub fn http_method(&mut self, method: HttpMethod) -> &mut Self {
        self.http_method = Some(method);
        self
    }

    /// Set a header, replacing any existing value for the same
    /// (case-insensitive) name.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        upsert(&mut self.headers, name.into(), value.into(), true);
        self
    }

    pub fn headers<I, K, V>(&mut self, headers: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in headers {
            self.header(k, v);
        }
        self
    }

    /// Set a query parameter, replacing any earlier value for `name`.
    pub fn query_param(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        upsert(&mut self.query_params, name.into(), value.into(), false);
        self
    }

    pub fn query_params<I, K, V>(&mut self, params: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in params {
            self.query_param(k, v);
        }
        self
    }

    /// Request body. Only sent for methods that carry a payload.
    pub fn body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = Some(body.into());
        self
    }

    pub fn disable_caching(&mut self, disable: bool) -> &mut Self {
        self.disable_caching = disable;
        self
    }

    pub fn block_redirect(&mut self, block: bool) -> &mut Self {
        self.block_redirect = block;
        self
    }

    #[cfg(test)]
    pub(crate) fn session(&mut self, session: &'static SessionManager) -> &mut Self {
        self.session = Some(session);
        self
    }

    fn finish(self) -> Result<Arc<Client>, BuildError> {
        let raw_url = match self.url {
            Some(url) if !url.trim().is_empty() => url,
            _ => return Err(BuildError::MissingUrl),
        };
        let method = self.http_method.ok_or(BuildError::MissingMethod)?;
        let url = Url::parse(raw_url.trim())
            .map_err(|e| BuildError::InvalidUrl(format!("{raw_url}: {e}")))?;

        #[cfg(test)]
        let session = self.session.unwrap_or_else(SessionManager::shared);
        #[cfg(not(test))]
        let session = SessionManager::shared();

        let config = RequestConfig {
            url,
            method,
            headers: self.headers,
            query_params: self.query_params,
            body: self.body,
            timeout: self.timeout,
            disable_caching: self.disable_caching,
            block_redirect: self.block_redirect,
            delegate: self.delegate,
        };
        Ok(Arc::new_cyclic(|me| Client {
            config,
            session,
            me: me.clone(),
            inner: Mutex::new(Inner::default()),
        }))
    }
}

fn upsert(list: &mut Vec<(String, String)>, name: String, value: String, ignore_case: bool) {
    let existing = list.iter_mut().find(|(k, _)| {
        if ignore_case {
            k.eq_ignore_ascii_case(&name)
        } else {
            *k == name
        }
    });
    match existing {
        Some(entry) => entry.1 = value,
        None => list.push((name, value)),
    }
}

/// Frozen configuration of one client.
#[derive(Debug)]
struct RequestConfig {
    url: Url,
    method: HttpMethod,
    headers: Headers,
    query_params: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    timeout: Option<Duration>,
    disable_caching: bool,
    block_redirect: bool,
    delegate: Option<Weak<dyn ClientDelegate>>,
}

struct Inner {
    state: ClientState,
    request: Option<HttpRequest>,
    task: Option<DataTask>,
    status: u16,
    headers: Headers,
    body: Vec<u8>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: ClientState::Unprepared,
            request: None,
            task: None,
            status: 0,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

/// One HTTP request with delegate callbacks. Create with [`Client::build`];
/// use each client for exactly one request.
pub struct Client {
    config: RequestConfig,
    session: &'static SessionManager,
    me: Weak<Client>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("method", &self.config.method)
            .field("url", &self.config.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl Client {
    /// Configure and create a client.
    ///
    /// Fails when the closure leaves the URL or the HTTP method unset, or
    /// sets a URL that does not parse.
    pub fn build<F>(configure: F) -> Result<Arc<Client>, BuildError>
    where
        F: FnOnce(&mut ClientBuilder),
    {
        let mut builder = ClientBuilder::default();
        configure(&mut builder);
        builder.finish()
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    pub fn url(&self) -> &Url {
        &self.config.url
    }

    pub fn http_method(&self) -> HttpMethod {
        self.config.method
    }

    /// The assembled request, once prepared.
    pub fn prepared_request(&self) -> Option<HttpRequest> {
        self.inner.lock().request.clone()
    }

    /// Id of the running task, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        self.inner.lock().task.as_ref().map(DataTask::id)
    }

    /// Assemble the request. Ignored unless the client is unprepared.
    pub fn prepare_request(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ClientState::Unprepared {
            tracing::debug!(state = ?inner.state, "prepare_request ignored");
            return;
        }
        inner.request = Some(self.assemble());
        inner.state = ClientState::Prepared;
    }

    /// Hand the request to the session. Prepares first if needed; ignored
    /// once the client is running or finished. Never blocks on the network.
    pub fn start_request(&self) {
        let request = {
            let mut inner = self.inner.lock();
            if inner.state == ClientState::Unprepared {
                inner.request = Some(self.assemble());
                inner.state = ClientState::Prepared;
            }
            if inner.state != ClientState::Prepared {
                tracing::debug!(state = ?inner.state, "start_request ignored");
                return;
            }
            let Some(request) = inner.request.clone() else {
                return;
            };
            inner.state = ClientState::Running;
            request
        };

        let me: Weak<dyn SessionDelegate> = self.me.clone() as Weak<dyn SessionDelegate>;
        match self.session.start_weak(request, me) {
            Some(task) => {
                let mut inner = self.inner.lock();
                if inner.state == ClientState::Running {
                    tracing::debug!(task = task.id(), url = %self.config.url, "request started");
                    inner.task = Some(task);
                } else {
                    // Cancelled (or already finished) while the task was being scheduled.
                    drop(inner);
                    self.session.cancel_data_task(&task);
                }
            }
            None => self.fail_unscheduled(),
        }
    }

    /// Cancel the request. No success or failure callback is delivered once
    /// this takes effect. Ignored unless prepared or running.
    pub fn cancel_request(&self) {
        let task = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, ClientState::Prepared | ClientState::Running) {
                tracing::debug!(state = ?inner.state, "cancel_request ignored");
                return;
            }
            inner.state = ClientState::Cancelled;
            inner.body = Vec::new();
            inner.task.take()
        };
        tracing::debug!(url = %self.config.url, "request cancelled");
        if let Some(task) = task {
            self.session.cancel_data_task(&task);
        }
    }

    fn assemble(&self) -> HttpRequest {
        let mut url = self.config.url.clone();
        if !self.config.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &self.config.query_params {
                pairs.append_pair(k, v);
            }
        }

        let mut request = HttpRequest::new(self.config.method, url);
        request.headers = self.config.headers.clone();
        request.timeout = self.session.config().effective_request_timeout(self.config.timeout);
        if self.config.disable_caching {
            request.cache_policy = CachePolicy::ReloadIgnoringCache;
            upsert(&mut request.headers, "Cache-Control".to_string(), "no-cache".to_string(), true);
            upsert(&mut request.headers, "Pragma".to_string(), "no-cache".to_string(), true);
        }
        if self.config.method.carries_body() {
            request.body = self.config.body.clone();
        }
        request
    }

    fn delegate(&self) -> Option<Arc<dyn ClientDelegate>> {
        self.config.delegate.as_ref().and_then(Weak::upgrade)
    }

    /// The session refused the request; report it like any transport failure.
    fn fail_unscheduled(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != ClientState::Running {
                return;
            }
            inner.state = ClientState::Failed;
        }
        let reason = format!("cannot schedule request to {}", self.config.url);
        let error = TransportError::InvalidRequest(reason);
        tracing::warn!(url = %self.config.url, "session declined request");
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.session.dispatch(move || {
            if let Some(delegate) = me.delegate() {
                delegate.on_failure(&me, error);
            }
        });
    }
}

impl SessionDelegate for Client {
    fn will_redirect(&self, _task: TaskId, _response: &ResponseHead, new_url: &Url) -> bool {
        if self.state() != ClientState::Running {
            return false;
        }
        if self.config.block_redirect {
            tracing::debug!(to = %new_url, "redirect blocked by configuration");
            return false;
        }
        match self.delegate() {
            Some(delegate) => delegate.should_redirect(self, new_url),
            None => true,
        }
    }

    fn did_receive_response(&self, _task: TaskId, response: &ResponseHead) {
        let mut inner = self.inner.lock();
        if inner.state != ClientState::Running {
            return;
        }
        inner.status = response.status;
        inner.headers = response.headers.clone();
        inner.body.clear();
    }

    fn did_receive_data(&self, _task: TaskId, data: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.state == ClientState::Running {
            inner.body.extend_from_slice(data);
        }
    }

    fn did_complete(&self, task: TaskId, result: Result<(), TransportError>) {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.state != ClientState::Running {
                return;
            }
            inner.task = None;
            match result {
                Ok(()) => {
                    inner.state = ClientState::Succeeded;
                    Ok((
                        inner.status,
                        std::mem::take(&mut inner.headers),
                        std::mem::take(&mut inner.body),
                    ))
                }
                Err(e) => {
                    inner.state = ClientState::Failed;
                    Err(e)
                }
            }
        };

        let Some(delegate) = self.delegate() else {
            tracing::debug!(task, "delegate dropped, outcome discarded");
            return;
        };
        match outcome {
            Ok((status, headers, body)) => {
                tracing::debug!(task, status, len = body.len(), "request succeeded");
                delegate.on_success(self, status, &headers, body);
            }
            Err(error) => {
                tracing::debug!(task, %error, "request failed");
                delegate.on_failure(self, error);
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = self.inner.get_mut().task.take() {
            self.session.cancel_data_task(&task);
        }
    }
}
