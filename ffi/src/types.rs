//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Each type mirrors a core type but uses C-compatible representations:
//! `*const c_char` instead of `String`, pointer + length instead of `Vec`,
//! and enums with explicit discriminants. Data handed to C callbacks is
//! borrowed for the duration of the call only. Conversion helpers live here
//! to keep `lib.rs` focused on the `extern "C"` surface.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;

use courier_core::{Client, ClientDelegate, ClientState, Headers, TransportError};
use url::Url;

/// Opaque handle to a `Client`. C callers receive a pointer to this and
/// pass it back into every `courier_client_*` function.
///
/// The handle owns the callback delegate; the client itself only holds it
/// weakly, so freeing the handle silences the request.
pub struct FfiClient {
    pub(crate) inner: Arc<Client>,
    pub(crate) _delegate: Arc<CallbackDelegate>,
}

// ---------------------------------------------------------------------------
// Configuration input (caller-provided, read but never freed by us)
// ---------------------------------------------------------------------------

/// A key-value pair of C strings, used for headers and query parameters.
#[repr(C)]
pub struct FfiKeyValue {
    pub key: *const c_char,
    pub value: *const c_char,
}

/// Client configuration described as C-compatible plain data.
///
/// `url` and `method` are required. `method` is an HTTP method name such
/// as `"GET"` (case-insensitive). `body` may be null. `timeout_ms` of 0
/// keeps the session default.
#[repr(C)]
pub struct FfiClientConfig {
    pub url: *const c_char,
    pub method: *const c_char,
    pub headers: *const FfiKeyValue,
    pub headers_len: u32,
    pub query: *const FfiKeyValue,
    pub query_len: u32,
    pub body: *const u8,
    pub body_len: usize,
    pub timeout_ms: u64,
    pub disable_caching: bool,
    pub block_redirect: bool,
}

/// Outcome of `courier_client_build`, written through its out pointer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiBuildStatus {
    Ok = 0,
    NullArg = 1,
    MissingUrl = 2,
    MissingMethod = 3,
    InvalidUrl = 4,
    InvalidMethod = 5,
    InvalidUtf8 = 6,
    Panic = 7,
}

// ---------------------------------------------------------------------------
// Delegate callbacks
// ---------------------------------------------------------------------------

/// Final response handed to `on_success`. Every pointer is borrowed and only
/// valid until the callback returns.
#[repr(C)]
pub struct FfiResponse {
    pub status: u16,
    pub headers: *const FfiKeyValue,
    pub headers_len: u32,
    pub body: *const u8,
    pub body_len: usize,
}

/// Failure categories handed to `on_failure`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    InvalidRequest = 1,
    TimedOut = 2,
    TooManyRedirects = 3,
    Cancelled = 4,
    Io = 5,
    Network = 6,
}

impl From<&TransportError> for FfiErrorCode {
    fn from(e: &TransportError) -> Self {
        match e {
            TransportError::InvalidRequest(_) => FfiErrorCode::InvalidRequest,
            TransportError::TimedOut => FfiErrorCode::TimedOut,
            TransportError::TooManyRedirects => FfiErrorCode::TooManyRedirects,
            TransportError::Cancelled => FfiErrorCode::Cancelled,
            TransportError::Io(_) => FfiErrorCode::Io,
            TransportError::Network(_) => FfiErrorCode::Network,
        }
    }
}

/// Failure handed to `on_failure`. `message` is borrowed for the call.
#[repr(C)]
pub struct FfiError {
    pub code: FfiErrorCode,
    pub message: *const c_char,
}

pub type FfiSuccessCallback = extern "C" fn(user_data: *mut c_void, response: *const FfiResponse);
pub type FfiFailureCallback = extern "C" fn(user_data: *mut c_void, error: *const FfiError);
pub type FfiRedirectCallback =
    extern "C" fn(user_data: *mut c_void, new_url: *const c_char) -> bool;

/// C delegate. Callbacks run on the session's dispatch thread, never on the
/// thread that started the request. A null `should_redirect` allows every
/// redirect.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FfiDelegate {
    pub user_data: *mut c_void,
    pub on_success: Option<FfiSuccessCallback>,
    pub on_failure: Option<FfiFailureCallback>,
    pub should_redirect: Option<FfiRedirectCallback>,
}

impl FfiDelegate {
    pub(crate) fn silent() -> Self {
        Self {
            user_data: std::ptr::null_mut(),
            on_success: None,
            on_failure: None,
            should_redirect: None,
        }
    }
}

/// Adapts an `FfiDelegate` to `ClientDelegate`.
pub(crate) struct CallbackDelegate {
    callbacks: FfiDelegate,
}

// The C caller guarantees `user_data` may be used from the dispatch thread.
unsafe impl Send for CallbackDelegate {}
unsafe impl Sync for CallbackDelegate {}

impl CallbackDelegate {
    pub(crate) fn new(callbacks: FfiDelegate) -> Self {
        Self { callbacks }
    }
}

impl ClientDelegate for CallbackDelegate {
    fn on_success(&self, _client: &Client, status: u16, headers: &Headers, body: Vec<u8>) {
        let Some(callback) = self.callbacks.on_success else {
            return;
        };
        let owned: Vec<(CString, CString)> = headers
            .iter()
            .map(|(k, v)| (c_string(k), c_string(v)))
            .collect();
        let pairs: Vec<FfiKeyValue> = owned
            .iter()
            .map(|(k, v)| FfiKeyValue {
                key: k.as_ptr(),
                value: v.as_ptr(),
            })
            .collect();
        let response = FfiResponse {
            status,
            headers: if pairs.is_empty() { std::ptr::null() } else { pairs.as_ptr() },
            headers_len: pairs.len() as u32,
            body: if body.is_empty() { std::ptr::null() } else { body.as_ptr() },
            body_len: body.len(),
        };
        callback(self.callbacks.user_data, &response);
    }

    fn on_failure(&self, _client: &Client, error: TransportError) {
        let Some(callback) = self.callbacks.on_failure else {
            return;
        };
        let message = c_string(&error.to_string());
        let error = FfiError {
            code: FfiErrorCode::from(&error),
            message: message.as_ptr(),
        };
        callback(self.callbacks.user_data, &error);
    }

    fn should_redirect(&self, _client: &Client, new_url: &Url) -> bool {
        match self.callbacks.should_redirect {
            Some(callback) => {
                let url = c_string(new_url.as_str());
                callback(self.callbacks.user_data, url.as_ptr())
            }
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Client state
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiClientState {
    Unprepared = 0,
    Prepared = 1,
    Running = 2,
    Succeeded = 3,
    Failed = 4,
    Cancelled = 5,
    /// The handle passed in was null.
    Invalid = -1,
}

impl From<ClientState> for FfiClientState {
    fn from(s: ClientState) -> Self {
        match s {
            ClientState::Unprepared => FfiClientState::Unprepared,
            ClientState::Prepared => FfiClientState::Prepared,
            ClientState::Running => FfiClientState::Running,
            ClientState::Succeeded => FfiClientState::Succeeded,
            ClientState::Failed => FfiClientState::Failed,
            ClientState::Cancelled => FfiClientState::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------

/// `CString` from text that may contain NUL bytes (they are dropped).
pub(crate) fn c_string(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

/// Borrow a nullable C string as UTF-8.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn opt_str<'a>(ptr: *const c_char) -> Result<Option<&'a str>, FfiBuildStatus> {
    if ptr.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(Some)
        .map_err(|_| FfiBuildStatus::InvalidUtf8)
}

/// Copy a caller-provided array of pairs. Entries with a null key are
/// skipped; a null value reads as the empty string.
///
/// # Safety
/// `ptr` must be null or point to `len` readable `FfiKeyValue`s whose
/// strings satisfy [`opt_str`].
pub(crate) unsafe fn key_values(
    ptr: *const FfiKeyValue,
    len: u32,
) -> Result<Vec<(String, String)>, FfiBuildStatus> {
    if ptr.is_null() || len == 0 {
        return Ok(Vec::new());
    }
    let entries = unsafe { std::slice::from_raw_parts(ptr, len as usize) };
    let mut pairs = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(key) = (unsafe { opt_str(entry.key) })? else {
            continue;
        };
        let value = (unsafe { opt_str(entry.value) })?.unwrap_or("");
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}
