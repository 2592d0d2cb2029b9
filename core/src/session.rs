//! The process-wide session shared by every client.
//!
//! # Design
//! `SessionManager` owns the transport, a bounded pool of blocking I/O
//! workers and one dispatch thread. Every transport event is queued to the
//! dispatch thread in the order the worker produced it; there the registry
//! is consulted and the event is forwarded to the task's delegate. Callers
//! therefore never see a callback on their own thread, and for one task all
//! data is delivered before its completion.
//!
//! Delegates registered with `start_data_task_with_delegate` are held
//! weakly. A task whose delegate has gone away is stale: its events are
//! dropped and its transport is told to stop.
//!
//! Cancellation flips the task's atomic flag and removes its registry entry.
//! The dispatch path checks both before each delivery, so an event already
//! sitting in the queue is discarded rather than delivered.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::config::SessionConfig;
use crate::error::{ConfigError, TransportError};
use crate::http::{HttpRequest, HttpResponse, ResponseHead};
use crate::registry::{DelegateRef, TaskRegistry};
use crate::transport::{TaskEvents, Transport, UreqTransport};

pub type TaskId = u64;

static SHARED: OnceLock<SessionManager> = OnceLock::new();
static SHARED_CONFIG: OnceLock<SessionConfig> = OnceLock::new();

/// Low-level receiver of one task's transport events.
///
/// All methods run on the session's dispatch thread.
pub trait SessionDelegate: Send + Sync {
    /// Decide whether to follow a redirect. Must return promptly: the I/O
    /// worker waits for the answer.
    fn will_redirect(&self, task: TaskId, response: &ResponseHead, new_url: &Url) -> bool {
        let _ = (task, response, new_url);
        true
    }

    fn did_receive_response(&self, task: TaskId, response: &ResponseHead) {
        let _ = (task, response);
    }

    fn did_receive_data(&self, task: TaskId, data: &[u8]);

    fn did_complete(&self, task: TaskId, result: Result<(), TransportError>);
}

/// Handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct DataTask {
    id: TaskId,
    cancelled: Arc<AtomicBool>,
}

impl DataTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

enum Event {
    Response(ResponseHead),
    Data(Vec<u8>),
    Redirect {
        response: ResponseHead,
        new_url: Url,
        reply: oneshot::Sender<bool>,
    },
    Complete(Result<(), TransportError>),
}

enum Dispatch {
    Task { task: TaskId, event: Event },
    Job(Box<dyn FnOnce() + Send>),
}

/// Shared entry point to the network.
///
/// Obtain it with [`SessionManager::shared`]; there is no public constructor.
pub struct SessionManager {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<TaskRegistry>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    runtime: tokio::runtime::Runtime,
    next_id: AtomicU64,
}

impl SessionManager {
    /// The process-wide session, created on first use.
    pub fn shared() -> &'static SessionManager {
        SHARED.get_or_init(|| {
            let config = SHARED_CONFIG.get_or_init(SessionConfig::default).clone();
            let transport = Arc::new(UreqTransport::new(&config));
            match SessionManager::with_transport(config, transport) {
                Ok(session) => session,
                Err(e) => panic!("failed to start the shared HTTP session: {e}"),
            }
        })
    }

    /// Set the configuration of the shared session. Only effective before
    /// the first call to [`SessionManager::shared`].
    pub fn configure(config: SessionConfig) -> Result<(), ConfigError> {
        if SHARED.get().is_some() {
            return Err(ConfigError::AlreadyInitialized);
        }
        SHARED_CONFIG.set(config).map_err(|_| ConfigError::AlreadyInitialized)
    }

    pub(crate) fn with_transport(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.max_io_threads)
            .thread_name("courier-io")
            .enable_time()
            .build()?;

        let registry = Arc::new(TaskRegistry::default());
        let (dispatch, rx) = mpsc::unbounded_channel();
        let dispatch_registry = Arc::clone(&registry);
        std::thread::Builder::new()
            .name("courier-dispatch".to_string())
            .spawn(move || run_dispatch(rx, &dispatch_registry))?;

        Ok(Self {
            config,
            transport,
            registry,
            dispatch,
            runtime,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of tasks currently registered.
    pub fn active_tasks(&self) -> usize {
        self.registry.len()
    }

    /// Start a task that reports once, on the dispatch thread, with the
    /// buffered response or the transport error. Redirects are followed.
    ///
    /// Returns `None` if the request cannot be scheduled.
    pub fn start_data_task<F>(&self, request: HttpRequest, completion: F) -> Option<DataTask>
    where
        F: FnOnce(Result<HttpResponse, TransportError>) + Send + 'static,
    {
        let delegate = Arc::new(CompletionDelegate::new(completion));
        self.schedule(request, DelegateRef::Owned(delegate))
    }

    /// Start a task whose events are forwarded to `delegate`, which is not
    /// retained.
    ///
    /// Returns `None` if the request cannot be scheduled.
    pub fn start_data_task_with_delegate<D>(
        &self,
        request: HttpRequest,
        delegate: &Arc<D>,
    ) -> Option<DataTask>
    where
        D: SessionDelegate + 'static,
    {
        let weak: Weak<dyn SessionDelegate> = Arc::<D>::downgrade(delegate);
        self.schedule(request, DelegateRef::Weak(weak))
    }

    pub(crate) fn start_weak(
        &self,
        request: HttpRequest,
        delegate: Weak<dyn SessionDelegate>,
    ) -> Option<DataTask> {
        self.schedule(request, DelegateRef::Weak(delegate))
    }

    /// Cancel a task. Idempotent. Events for the task that are still queued
    /// are discarded.
    ///
    /// The dispatch thread checks the flag immediately before each delegate
    /// call, so a cancel issued from inside a callback silences everything
    /// after it. A cancel from another thread can race one callback that has
    /// already passed that check; at most that callback still runs.
    /// `Client::cancel_request` has no such window because the client checks
    /// its own state under its lock before calling its delegate.
    pub fn cancel_data_task(&self, task: &DataTask) {
        if task.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.registry.remove(task.id) {
            tracing::debug!(task = task.id, "data task cancelled");
        }
    }

    /// Run `job` on the dispatch thread.
    pub(crate) fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.dispatch.send(Dispatch::Job(Box::new(job))).is_err() {
            tracing::error!("dispatch thread is gone, dropping job");
        }
    }

    fn schedule(&self, request: HttpRequest, delegate: DelegateRef) -> Option<DataTask> {
        if let Err(reason) = validate(&request) {
            tracing::warn!(url = %request.url, %reason, "refusing to schedule request");
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.registry.register(id, delegate, Arc::clone(&cancelled));

        tracing::debug!(
            task = id,
            method = %request.method,
            url = %request.url,
            "starting data task"
        );

        let context = TaskContext {
            task: id,
            cancelled: Arc::clone(&cancelled),
            dispatch: self.dispatch.clone(),
            runtime: self.runtime.handle().clone(),
            redirect_timeout: self.config.redirect_decision_timeout,
        };
        let transport = Arc::clone(&self.transport);
        self.runtime.spawn_blocking(move || {
            let result = transport.execute(request, &context);
            if let Err(e) = &result {
                tracing::debug!(task = context.task, error = %e, "data task failed");
            }
            context.send(Event::Complete(result));
        });

        Some(DataTask { id, cancelled })
    }
}

fn validate(request: &HttpRequest) -> Result<(), String> {
    match request.url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme {other:?}")),
    }
    if request.url.host_str().is_none_or(str::is_empty) {
        return Err("missing host".to_string());
    }
    Ok(())
}

fn run_dispatch(mut rx: mpsc::UnboundedReceiver<Dispatch>, registry: &TaskRegistry) {
    while let Some(item) = rx.blocking_recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| match item {
            Dispatch::Task { task, event } => deliver(registry, task, event),
            Dispatch::Job(job) => job(),
        }));
        if outcome.is_err() {
            tracing::error!("delegate callback panicked");
        }
    }
}

fn deliver(registry: &TaskRegistry, task: TaskId, event: Event) {
    match event {
        Event::Response(head) => {
            if let Some(delegate) = registry.live(task) {
                delegate.did_receive_response(task, &head);
            }
        }
        Event::Data(chunk) => {
            if let Some(delegate) = registry.live(task) {
                delegate.did_receive_data(task, &chunk);
            }
        }
        Event::Redirect { response, new_url, reply } => {
            let allow = registry
                .live(task)
                .is_some_and(|delegate| delegate.will_redirect(task, &response, &new_url));
            let _ = reply.send(allow);
        }
        Event::Complete(result) => {
            if let Some(delegate) = registry.finish(task) {
                delegate.did_complete(task, result);
            }
        }
    }
}

/// Worker-side view of a running task.
struct TaskContext {
    task: TaskId,
    cancelled: Arc<AtomicBool>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    runtime: tokio::runtime::Handle,
    redirect_timeout: Duration,
}

impl TaskContext {
    fn send(&self, event: Event) {
        let item = Dispatch::Task { task: self.task, event };
        if self.dispatch.send(item).is_err() {
            tracing::error!(task = self.task, "dispatch thread is gone, dropping event");
        }
    }
}

impl TaskEvents for TaskContext {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn propose_redirect(&self, response: &ResponseHead, new_url: &Url) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let (reply, decision) = oneshot::channel();
        self.send(Event::Redirect {
            response: response.clone(),
            new_url: new_url.clone(),
            reply,
        });
        match self
            .runtime
            .block_on(tokio::time::timeout(self.redirect_timeout, decision))
        {
            Ok(Ok(allow)) => allow,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(
                    task = self.task,
                    url = %new_url,
                    "redirect decision timed out, rejecting"
                );
                false
            }
        }
    }

    fn response(&self, head: ResponseHead) {
        self.send(Event::Response(head));
    }

    fn data(&self, chunk: Vec<u8>) {
        tracing::trace!(task = self.task, len = chunk.len(), "received data");
        self.send(Event::Data(chunk));
    }
}

/// Adapts a completion closure to the delegate surface.
struct CompletionDelegate<F> {
    completion: Mutex<Option<F>>,
    head: Mutex<Option<ResponseHead>>,
    body: Mutex<Vec<u8>>,
}

impl<F> CompletionDelegate<F> {
    fn new(completion: F) -> Self {
        Self {
            completion: Mutex::new(Some(completion)),
            head: Mutex::new(None),
            body: Mutex::new(Vec::new()),
        }
    }
}

impl<F> SessionDelegate for CompletionDelegate<F>
where
    F: FnOnce(Result<HttpResponse, TransportError>) + Send + 'static,
{
    fn did_receive_response(&self, _task: TaskId, response: &ResponseHead) {
        *self.head.lock() = Some(response.clone());
        self.body.lock().clear();
    }

    fn did_receive_data(&self, _task: TaskId, data: &[u8]) {
        self.body.lock().extend_from_slice(data);
    }

    fn did_complete(&self, _task: TaskId, result: Result<(), TransportError>) {
        let Some(completion) = self.completion.lock().take() else {
            return;
        };
        let response = result.and_then(|()| {
            let head = self
                .head
                .lock()
                .take()
                .ok_or_else(|| {
                    TransportError::Network("completed without a response".to_string())
                })?;
            Ok(HttpResponse {
                status: head.status,
                url: head.url,
                headers: head.headers,
                body: std::mem::take(&mut *self.body.lock()),
            })
        });
        completion(response);
    }
}
