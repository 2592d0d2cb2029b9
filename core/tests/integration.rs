//! End-to-end tests against the live mock server.
//!
//! # Design
//! Each test starts the mock server on a random port and drives real
//! clients through the shared session and the ureq transport. Delegates
//! forward outcomes into channels so the test thread can wait on them.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_core::{
    Client, ClientDelegate, ConfigError, Headers, HttpMethod, HttpRequest, SessionConfig,
    SessionManager, TransportError,
};
use mock_server::Echo;
use url::Url;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Outcome {
    Success { status: u16, headers: Headers, body: Vec<u8> },
    Failure(TransportError),
}

impl Outcome {
    fn expect_success(self) -> (u16, Headers, Vec<u8>) {
        match self {
            Outcome::Success { status, headers, body } => (status, headers, body),
            Outcome::Failure(e) => panic!("expected success, got failure: {e}"),
        }
    }

    fn echo(self) -> Echo {
        let (status, _, body) = self.expect_success();
        assert_eq!(status, 200);
        serde_json::from_slice(&body).unwrap()
    }
}

struct Recorder {
    tx: Mutex<mpsc::Sender<Outcome>>,
    allow_redirect: bool,
}

impl Recorder {
    fn new() -> (Arc<Self>, mpsc::Receiver<Outcome>) {
        Self::with_redirects(true)
    }

    fn with_redirects(allow_redirect: bool) -> (Arc<Self>, mpsc::Receiver<Outcome>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(tx),
                allow_redirect,
            }),
            rx,
        )
    }
}

impl ClientDelegate for Recorder {
    fn on_success(&self, _client: &Client, status: u16, headers: &Headers, body: Vec<u8>) {
        let _ = self.tx.lock().unwrap().send(Outcome::Success {
            status,
            headers: headers.clone(),
            body,
        });
    }

    fn on_failure(&self, _client: &Client, error: TransportError) {
        let _ = self.tx.lock().unwrap().send(Outcome::Failure(error));
    }

    fn should_redirect(&self, _client: &Client, _new_url: &Url) -> bool {
        self.allow_redirect
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Start the mock server on a random port and return its base URL.
fn start_server() -> String {
    init_tracing();
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });

    format!("http://{addr}")
}

#[test]
fn get_merges_query_and_headers() {
    let base = start_server();
    let (delegate, rx) = Recorder::new();
    let client = Client::build(|b| {
        b.delegate(&delegate)
            .url(format!("{base}/echo?fixed=yes"))
            .http_method(HttpMethod::Get)
            .header("X-Token", "secret")
            .query_param("page", "2")
            .disable_caching(true);
    })
    .unwrap();
    client.start_request();

    let echo = rx.recv_timeout(WAIT).unwrap().echo();
    assert_eq!(echo.method, "GET");
    assert_eq!(echo.query.get("fixed").map(String::as_str), Some("yes"));
    assert_eq!(echo.query.get("page").map(String::as_str), Some("2"));
    assert_eq!(echo.headers.get("x-token").map(String::as_str), Some("secret"));
    assert_eq!(echo.headers.get("cache-control").map(String::as_str), Some("no-cache"));
}

#[test]
fn payload_methods_send_body() {
    let base = start_server();
    for method in [HttpMethod::Post, HttpMethod::Put, HttpMethod::Patch] {
        let (delegate, rx) = Recorder::new();
        let client = Client::build(|b| {
            b.delegate(&delegate)
                .url(format!("{base}/echo"))
                .http_method(method)
                .header("Content-Type", "text/plain")
                .body("payload");
        })
        .unwrap();
        client.start_request();

        let echo = rx.recv_timeout(WAIT).unwrap().echo();
        assert_eq!(echo.method, method.as_str());
        assert_eq!(echo.body, "payload", "{method}");
    }
}

#[test]
fn get_never_sends_body() {
    let base = start_server();
    let (delegate, rx) = Recorder::new();
    let client = Client::build(|b| {
        b.delegate(&delegate)
            .url(format!("{base}/echo"))
            .http_method(HttpMethod::Get)
            .body("ignored");
    })
    .unwrap();
    client.start_request();

    assert_eq!(rx.recv_timeout(WAIT).unwrap().echo().body, "");
}

#[test]
fn error_status_is_reported_as_success() {
    let base = start_server();
    let (delegate, rx) = Recorder::new();
    let client = Client::build(|b| {
        b.delegate(&delegate).url(format!("{base}/status/404")).http_method(HttpMethod::Get);
    })
    .unwrap();
    client.start_request();

    let (status, headers, body) = rx.recv_timeout(WAIT).unwrap().expect_success();
    assert_eq!(status, 404);
    assert!(headers.iter().any(|(k, v)| k.eq_ignore_ascii_case("x-status") && v == "404"));
    assert_eq!(body, b"status 404");
}

#[test]
fn redirect_is_followed() {
    let base = start_server();
    let (delegate, rx) = Recorder::new();
    let client = Client::build(|b| {
        b.delegate(&delegate).url(format!("{base}/redirect?to=/echo")).http_method(HttpMethod::Get);
    })
    .unwrap();
    client.start_request();

    assert_eq!(rx.recv_timeout(WAIT).unwrap().echo().method, "GET");
}

#[test]
fn see_other_turns_post_into_get() {
    let base = start_server();
    let (delegate, rx) = Recorder::new();
    let client = Client::build(|b| {
        b.delegate(&delegate)
            .url(format!("{base}/redirect?to=/echo&status=303"))
            .http_method(HttpMethod::Post)
            .body("form");
    })
    .unwrap();
    client.start_request();

    let echo = rx.recv_timeout(WAIT).unwrap().echo();
    assert_eq!(echo.method, "GET");
    assert_eq!(echo.body, "");
}

#[test]
fn blocked_redirect_returns_redirect_response() {
    let base = start_server();
    let (delegate, rx) = Recorder::new();
    let client = Client::build(|b| {
        b.delegate(&delegate)
            .url(format!("{base}/redirect?to=/echo"))
            .http_method(HttpMethod::Get)
            .block_redirect(true);
    })
    .unwrap();
    client.start_request();

    let (status, headers, _) = rx.recv_timeout(WAIT).unwrap().expect_success();
    assert_eq!(status, 302);
    assert!(headers.iter().any(|(k, v)| k.eq_ignore_ascii_case("location") && v == "/echo"));
}

#[test]
fn delegate_rejects_redirect() {
    let base = start_server();
    let (delegate, rx) = Recorder::with_redirects(false);
    let client = Client::build(|b| {
        b.delegate(&delegate)
            .url(format!("{base}/redirect?to=/echo&status=307"))
            .http_method(HttpMethod::Get);
    })
    .unwrap();
    client.start_request();

    assert_eq!(rx.recv_timeout(WAIT).unwrap().expect_success().0, 307);
}

#[test]
fn chunked_body_is_accumulated_in_order() {
    let base = start_server();
    let (delegate, rx) = Recorder::new();
    let client = Client::build(|b| {
        b.delegate(&delegate).url(format!("{base}/chunked?parts=5")).http_method(HttpMethod::Get);
    })
    .unwrap();
    client.start_request();

    let (_, _, body) = rx.recv_timeout(WAIT).unwrap().expect_success();
    assert_eq!(body, b"part-0\npart-1\npart-2\npart-3\npart-4\n");
}

#[test]
fn connection_refused_is_a_failure() {
    init_tracing();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (delegate, rx) = Recorder::new();
    let client = Client::build(|b| {
        b.delegate(&delegate).url(format!("http://127.0.0.1:{port}/")).http_method(HttpMethod::Get);
    })
    .unwrap();
    client.start_request();

    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::Failure(_)));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn cancelled_request_stays_silent() {
    let base = start_server();
    let (delegate, rx) = Recorder::new();
    let client = Client::build(|b| {
        b.delegate(&delegate).url(format!("{base}/slow?ms=300")).http_method(HttpMethod::Get);
    })
    .unwrap();
    client.start_request();
    client.cancel_request();

    assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());
}

#[test]
fn concurrent_clients_do_not_cross_deliver() {
    let base = start_server();
    let clients: Vec<_> = (0..50)
        .map(|i| {
            let (delegate, rx) = Recorder::new();
            let client = Client::build(|b| {
                b.delegate(&delegate)
                    .url(format!("{base}/echo"))
                    .http_method(HttpMethod::Get)
                    .query_param("client", i.to_string());
            })
            .unwrap();
            client.start_request();
            (i, client, delegate, rx)
        })
        .collect();

    for (i, _client, _delegate, rx) in clients {
        let echo = rx.recv_timeout(WAIT).unwrap().echo();
        assert_eq!(echo.query.get("client"), Some(&i.to_string()));
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
    }
}

#[test]
fn completion_task_delivers_response() {
    let base = start_server();
    let url = Url::parse(&format!("{base}/status/201")).unwrap();
    let (tx, rx) = mpsc::channel();
    let task = SessionManager::shared()
        .start_data_task(HttpRequest::new(HttpMethod::Get, url), move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    let response = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.text(), "status 201");
    assert!(!task.is_cancelled());
}

#[test]
fn shared_session_uses_default_timeouts_and_cannot_be_reconfigured() {
    let session = SessionManager::shared();
    assert!(std::ptr::eq(session, SessionManager::shared()));
    assert_eq!(session.config().request_timeout, Duration::from_secs(60));
    assert_eq!(session.config().resource_timeout, Duration::from_secs(7 * 24 * 60 * 60));
    assert_eq!(
        SessionManager::configure(SessionConfig::default().request_timeout(Duration::from_secs(5))),
        Err(ConfigError::AlreadyInitialized)
    );
}
