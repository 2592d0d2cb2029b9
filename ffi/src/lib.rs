//! C-ABI wrapper around `courier-core`.
//!
//! # Overview
//! Exposes the delegate-driven HTTP client through `extern "C"` functions so
//! any language with a C FFI can issue requests over the shared session
//! without touching Rust types directly.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - A client is configured from one `FfiClientConfig`; its delegate is a
//!   set of C function pointers plus an opaque `user_data`.
//! - Callbacks run on the session's dispatch thread. Data passed to them is
//!   borrowed for the duration of the call.
//! - The C caller owns every returned pointer and must release it with the
//!   matching `courier_*_free` function.

pub mod types;

use std::os::raw::c_char;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{Client, HttpMethod, SessionConfig, SessionManager};

use types::*;

// ---------------------------------------------------------------------------
// Client lifecycle
// ---------------------------------------------------------------------------

/// Create a client from `config`.
///
/// `delegate` may be null, in which case the request runs without
/// callbacks. On failure returns null and, if `status` is not null, writes
/// the reason there. The caller must free the returned pointer with
/// `courier_client_free`.
#[unsafe(no_mangle)]
pub extern "C" fn courier_client_build(
    config: *const FfiClientConfig,
    delegate: *const FfiDelegate,
    status: *mut FfiBuildStatus,
) -> *mut FfiClient {
    let result =
        catch_unwind(|| build_client(config, delegate)).unwrap_or(Err(FfiBuildStatus::Panic));
    let (client, code) = match result {
        Ok(client) => (Box::into_raw(Box::new(client)), FfiBuildStatus::Ok),
        Err(code) => {
            tracing::debug!(?code, "courier_client_build failed");
            (std::ptr::null_mut(), code)
        }
    };
    if !status.is_null() {
        unsafe { *status = code };
    }
    client
}

fn build_client(
    config: *const FfiClientConfig,
    delegate: *const FfiDelegate,
) -> Result<FfiClient, FfiBuildStatus> {
    if config.is_null() {
        return Err(FfiBuildStatus::NullArg);
    }
    let config = unsafe { &*config };
    let url = unsafe { opt_str(config.url) }?;
    let method = match unsafe { opt_str(config.method) }? {
        Some(name) => Some(name.parse::<HttpMethod>().map_err(|_| FfiBuildStatus::InvalidMethod)?),
        None => None,
    };
    let headers = unsafe { key_values(config.headers, config.headers_len) }?;
    let query = unsafe { key_values(config.query, config.query_len) }?;
    let body = if config.body.is_null() {
        None
    } else {
        Some(unsafe { std::slice::from_raw_parts(config.body, config.body_len) }.to_vec())
    };

    let callbacks = if delegate.is_null() {
        FfiDelegate::silent()
    } else {
        unsafe { *delegate }
    };
    let delegate = Arc::new(CallbackDelegate::new(callbacks));

    let client = Client::build(|b| {
        b.delegate(&delegate)
            .headers(headers)
            .query_params(query)
            .disable_caching(config.disable_caching)
            .block_redirect(config.block_redirect);
        if let Some(url) = url {
            b.url(url);
        }
        if let Some(method) = method {
            b.http_method(method);
        }
        if let Some(body) = body {
            b.body(body);
        }
        if config.timeout_ms > 0 {
            b.timeout(Duration::from_millis(config.timeout_ms));
        }
    })
    .map_err(|e| match e {
        courier_core::BuildError::MissingUrl => FfiBuildStatus::MissingUrl,
        courier_core::BuildError::MissingMethod => FfiBuildStatus::MissingMethod,
        courier_core::BuildError::InvalidUrl(_) => FfiBuildStatus::InvalidUrl,
    })?;

    Ok(FfiClient {
        inner: client,
        _delegate: delegate,
    })
}

/// Free a client created by `courier_client_build`. A running request is
/// cancelled and its callbacks are not delivered. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn courier_client_free(client: *mut FfiClient) {
    if !client.is_null() {
        let _ = catch_unwind(std::panic::AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(client) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Request control
// ---------------------------------------------------------------------------

/// Run `f` on the client behind `client`, ignoring null handles and panics.
fn with_client(client: *const FfiClient, name: &str, f: impl FnOnce(&Client)) {
    if client.is_null() {
        tracing::debug!(function = name, "null client handle");
        return;
    }
    let client = unsafe { &*client };
    if catch_unwind(std::panic::AssertUnwindSafe(|| f(&client.inner))).is_err() {
        tracing::error!(function = name, "panic caught at FFI boundary");
    }
}

/// Assemble the request without sending it. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn courier_client_prepare(client: *const FfiClient) {
    with_client(client, "courier_client_prepare", Client::prepare_request);
}

/// Send the request. Returns immediately; the outcome arrives through the
/// delegate. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn courier_client_start(client: *const FfiClient) {
    with_client(client, "courier_client_start", Client::start_request);
}

/// Cancel the request. No callback fires afterwards. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn courier_client_cancel(client: *const FfiClient) {
    with_client(client, "courier_client_cancel", Client::cancel_request);
}

/// Current lifecycle state, or `Invalid` for a null handle.
#[unsafe(no_mangle)]
pub extern "C" fn courier_client_state(client: *const FfiClient) -> FfiClientState {
    let mut state = FfiClientState::Invalid;
    with_client(client, "courier_client_state", |c| state = c.state().into());
    state
}

/// The prepared request URL, query parameters included.
///
/// Returns null until the client has been prepared. The caller must free the
/// returned string with `courier_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn courier_client_prepared_url(client: *const FfiClient) -> *mut c_char {
    let mut url = std::ptr::null_mut();
    with_client(client, "courier_client_prepared_url", |c| {
        if let Some(request) = c.prepared_request() {
            url = c_string(request.url.as_str()).into_raw();
        }
    });
    url
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Set the shared session's timeouts before its first use. Zero keeps a
/// default. Returns false once the session is already running.
#[unsafe(no_mangle)]
pub extern "C" fn courier_session_configure(
    request_timeout_ms: u64,
    resource_timeout_ms: u64,
) -> bool {
    catch_unwind(|| {
        let mut config = SessionConfig::default();
        if request_timeout_ms > 0 {
            config = config.request_timeout(Duration::from_millis(request_timeout_ms));
        }
        if resource_timeout_ms > 0 {
            config = config.resource_timeout(Duration::from_millis(resource_timeout_ms));
        }
        SessionManager::configure(config).is_ok()
    })
    .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Free a C string allocated by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn courier_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { std::ffi::CString::from_raw(s) });
        });
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
