//! C-ABI wrapper around `session-task-core`.
//!
//! # Overview
//! Lets any language with a C FFI build a request, bind it to a shared
//! client as a task, execute it asynchronously and receive exactly one
//! `(data, response, error)` callback, or cancel it midway.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - Tasks run on one process-wide tokio runtime that is never torn down,
//!   so freeing a task or client while a request is in flight still lets
//!   the callback fire.
//! - The C caller owns every returned handle and must release it with the
//!   matching `st_*_free` function. `user_data` must stay valid until the
//!   task's callback has run.

pub mod types;

use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use session_task::{
    ClientConfig, HttpClient, HttpRequest, RefreshTokenProvider, RequestTask, StaticToken,
};
use tokio::runtime::Runtime;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use types::*;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> Option<&'static Runtime> {
    if let Some(rt) = RUNTIME.get() {
        return Some(rt);
    }
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("session-task")
        .build()
        .ok()?;
    // A racing initializer may win; the spare runtime is simply dropped.
    Some(RUNTIME.get_or_init(|| rt))
}

/// Read a nullable C string. Null and non-UTF-8 input both yield `None`.
fn opt_str(s: *const c_char) -> Option<String> {
    if s.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(s) }.to_str().ok().map(str::to_string)
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install a `tracing` subscriber writing to stderr, filtered by `RUST_LOG`
/// (default `info`). Later calls are ignored.
#[unsafe(no_mangle)]
pub extern "C" fn st_init_logging() {
    let _ = catch_unwind(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Client lifecycle
// ---------------------------------------------------------------------------

/// Create a client. Configuration is read from `SESSION_TASK_*` variables.
///
/// Credentials, all nullable:
/// - `token_url` and `refresh_token` set: expired tokens are refreshed
///   against `token_url`, seeded with `access_token` if given.
/// - only `access_token` set: a fixed bearer token.
/// - none: requests are sent without `Authorization`.
///
/// Returns null if the runtime or HTTP client cannot be created. Free with
/// `st_client_free`.
#[unsafe(no_mangle)]
pub extern "C" fn st_client_new(
    access_token: *const c_char,
    token_url: *const c_char,
    client_id: *const c_char,
    refresh_token: *const c_char,
) -> *mut FfiClient {
    catch_unwind(|| {
        if runtime().is_none() {
            return std::ptr::null_mut();
        }
        let client = match HttpClient::new(ClientConfig::from_env()) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to create client");
                return std::ptr::null_mut();
            }
        };

        let access_token = opt_str(access_token);
        let client = match (opt_str(token_url), opt_str(refresh_token)) {
            (Some(url), Some(refresh)) => {
                let mut provider =
                    RefreshTokenProvider::new(url, opt_str(client_id).unwrap_or_default(), refresh);
                if let Some(token) = access_token {
                    provider = provider.with_access_token(token);
                }
                client.with_auth(Arc::new(provider))
            }
            _ => match access_token {
                Some(token) => client.with_auth(Arc::new(StaticToken::new(token))),
                None => client,
            },
        };
        Box::into_raw(Box::new(FfiClient {
            inner: Arc::new(client),
        }))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Free a client. Tasks already created from it keep working. Safe to call
/// with null.
#[unsafe(no_mangle)]
pub extern "C" fn st_client_free(client: *mut FfiClient) {
    if !client.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(client) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Request construction
// ---------------------------------------------------------------------------

/// Start a request. The URL is validated later, by `st_task_new`.
///
/// Returns null if `url` is null or not UTF-8. Free with `st_request_free`.
#[unsafe(no_mangle)]
pub extern "C" fn st_request_new(method: FfiHttpMethod, url: *const c_char) -> *mut FfiRequest {
    catch_unwind(|| match opt_str(url) {
        Some(url) => Box::into_raw(Box::new(FfiRequest {
            inner: HttpRequest::new(method.into(), url),
        })),
        None => std::ptr::null_mut(),
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Append a header to a request.
#[unsafe(no_mangle)]
pub extern "C" fn st_request_add_header(
    request: *mut FfiRequest,
    key: *const c_char,
    value: *const c_char,
) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        if request.is_null() {
            return FfiErrorCode::NullArg;
        }
        let (Some(key), Some(value)) = (opt_str(key), opt_str(value)) else {
            return FfiErrorCode::NullArg;
        };
        let request = unsafe { &mut *request };
        request.inner.headers.push((key, value));
        FfiErrorCode::Ok
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Copy `len` bytes from `data` into the request body. A null `data` with
/// `len == 0` clears the body.
#[unsafe(no_mangle)]
pub extern "C" fn st_request_set_body(
    request: *mut FfiRequest,
    data: *const u8,
    len: usize,
) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        if request.is_null() {
            return FfiErrorCode::NullArg;
        }
        let request = unsafe { &mut *request };
        if data.is_null() {
            if len != 0 {
                return FfiErrorCode::NullArg;
            }
            request.inner.body = None;
            return FfiErrorCode::Ok;
        }
        let body = unsafe { std::slice::from_raw_parts(data, len) }.to_vec();
        request.inner.body = Some(body);
        FfiErrorCode::Ok
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Free a request. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn st_request_free(request: *mut FfiRequest) {
    if !request.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(request) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Bind a copy of `request` to `client`.
///
/// Returns null if either argument is null or the request is invalid
/// (URL not absolute `http`/`https`, empty header name). The request can be
/// freed or reused afterwards. Free the task with `st_task_free`.
#[unsafe(no_mangle)]
pub extern "C" fn st_task_new(
    request: *const FfiRequest,
    client: *const FfiClient,
) -> *mut FfiTask {
    catch_unwind(AssertUnwindSafe(|| {
        if request.is_null() || client.is_null() {
            return std::ptr::null_mut();
        }
        let request = unsafe { &*request };
        let client = unsafe { &*client };
        match RequestTask::new(request.inner.clone(), client.inner.clone()) {
            Ok(task) => Box::into_raw(Box::new(FfiTask { inner: task })),
            Err(e) => {
                warn!(error = %e, "rejected task");
                std::ptr::null_mut()
            }
        }
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Execute a task. Returns immediately; `callback` runs exactly once on a
/// runtime thread with the outcome.
///
/// Returns `NullArg` for a null task or callback and `AlreadyExecuted` if
/// the task ran before. In those cases the callback is never invoked.
#[unsafe(no_mangle)]
pub extern "C" fn st_task_execute(
    task: *const FfiTask,
    callback: Option<FfiCompletionCallback>,
    user_data: *mut c_void,
) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        if task.is_null() {
            return FfiErrorCode::NullArg;
        }
        let Some(callback) = callback else {
            return FfiErrorCode::NullArg;
        };
        let Some(rt) = runtime() else {
            return FfiErrorCode::NoRuntime;
        };
        let task = unsafe { &*task };
        let user_data = UserData::new(user_data);
        match task.inner.execute_on(rt.handle(), move |result| {
            deliver(callback, user_data.as_ptr(), result);
        }) {
            Ok(()) => FfiErrorCode::Ok,
            Err(e) => FfiErrorCode::from(&e),
        }
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Cancel a running task. No effect before execution or after completion.
/// Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn st_task_cancel(task: *const FfiTask) {
    if !task.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            unsafe { &*task }.inner.cancel();
        }));
    }
}

/// Current lifecycle state. `Invalid` for a null task.
#[unsafe(no_mangle)]
pub extern "C" fn st_task_state(task: *const FfiTask) -> FfiTaskState {
    if task.is_null() {
        return FfiTaskState::Invalid;
    }
    catch_unwind(AssertUnwindSafe(|| unsafe { &*task }.inner.state().into()))
        .unwrap_or(FfiTaskState::Invalid)
}

/// Free a task. An in-flight request keeps running and its callback still
/// fires. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn st_task_free(task: *mut FfiTask) {
    if !task.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(task) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::sync::mpsc;
    use std::time::Duration;

    /// What the C callback observed, copied out of the borrowed pointers.
    #[derive(Debug)]
    struct Outcome {
        data: Vec<u8>,
        status: Option<u16>,
        error: Option<FfiErrorCode>,
        message: Option<String>,
    }

    extern "C" fn record(
        user_data: *mut c_void,
        data: *const u8,
        data_len: usize,
        response: *const FfiResponse,
        error: *const FfiError,
    ) {
        let tx = unsafe { &*(user_data as *const mpsc::Sender<Outcome>) };
        let data = if data.is_null() {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(data, data_len) }.to_vec()
        };
        let status = unsafe { response.as_ref() }.map(|r| r.status);
        let (error, message) = match unsafe { error.as_ref() } {
            Some(e) => (
                Some(e.code),
                Some(unsafe { CStr::from_ptr(e.message) }.to_string_lossy().into_owned()),
            ),
            None => (None, None),
        };
        let _ = tx.send(Outcome {
            data,
            status,
            error,
            message,
        });
    }

    /// Start the mock server on its own thread and return the base URL.
    fn start_server() -> String {
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

    fn new_task(client: *const FfiClient, url: &str) -> *mut FfiTask {
        let url = CString::new(url).unwrap();
        let request = st_request_new(FfiHttpMethod::Get, url.as_ptr());
        let task = st_task_new(request, client);
        st_request_free(request);
        task
    }

    fn anonymous_client() -> *mut FfiClient {
        st_client_new(
            std::ptr::null(),
            std::ptr::null(),
            std::ptr::null(),
            std::ptr::null(),
        )
    }

    #[test]
    fn client_new_and_free() {
        let client = anonymous_client();
        assert!(!client.is_null());
        st_client_free(client);

        let token = CString::new("abc").unwrap();
        let client = st_client_new(
            token.as_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            std::ptr::null(),
        );
        assert!(!client.is_null());
        st_client_free(client);
    }

    #[test]
    fn client_free_null_is_safe() {
        st_client_free(std::ptr::null_mut());
    }

    #[test]
    fn request_new_null_url_returns_null() {
        assert!(st_request_new(FfiHttpMethod::Get, std::ptr::null()).is_null());
    }

    #[test]
    fn request_add_header_and_body() {
        let url = CString::new("http://localhost:3000/me").unwrap();
        let request = st_request_new(FfiHttpMethod::Post, url.as_ptr());
        let key = CString::new("content-type").unwrap();
        let value = CString::new("application/json").unwrap();

        assert_eq!(
            st_request_add_header(request, key.as_ptr(), value.as_ptr()),
            FfiErrorCode::Ok
        );
        assert_eq!(
            st_request_add_header(request, key.as_ptr(), std::ptr::null()),
            FfiErrorCode::NullArg
        );
        let body = b"{}";
        assert_eq!(
            st_request_set_body(request, body.as_ptr(), body.len()),
            FfiErrorCode::Ok
        );

        let inner = unsafe { &(*request).inner };
        assert_eq!(inner.header("Content-Type"), Some("application/json"));
        assert_eq!(inner.body.as_deref(), Some(b"{}".as_slice()));

        assert_eq!(st_request_set_body(request, std::ptr::null(), 0), FfiErrorCode::Ok);
        assert!(unsafe { &(*request).inner }.body.is_none());
        assert_eq!(st_request_set_body(request, std::ptr::null(), 4), FfiErrorCode::NullArg);
        st_request_free(request);
    }

    #[test]
    fn task_new_null_arguments_return_null() {
        let client = anonymous_client();
        let url = CString::new("http://localhost:3000/ok").unwrap();
        let request = st_request_new(FfiHttpMethod::Get, url.as_ptr());

        assert!(st_task_new(std::ptr::null(), client).is_null());
        assert!(st_task_new(request, std::ptr::null()).is_null());

        let task = st_task_new(request, client);
        assert!(!task.is_null());
        assert_eq!(st_task_state(task), FfiTaskState::Idle);

        st_task_free(task);
        st_request_free(request);
        st_client_free(client);
    }

    #[test]
    fn task_new_invalid_url_returns_null() {
        let client = anonymous_client();
        assert!(new_task(client, "not a url").is_null());
        st_client_free(client);
    }

    #[test]
    fn execute_null_arguments() {
        let client = anonymous_client();
        let task = new_task(client, "http://localhost:3000/ok");
        assert_eq!(
            st_task_execute(std::ptr::null(), Some(record), std::ptr::null_mut()),
            FfiErrorCode::NullArg
        );
        assert_eq!(
            st_task_execute(task, None, std::ptr::null_mut()),
            FfiErrorCode::NullArg
        );
        assert_eq!(st_task_state(task), FfiTaskState::Idle);
        st_task_free(task);
        st_client_free(client);
    }

    #[test]
    fn execute_delivers_data_and_response() {
        let base = start_server();
        let client = anonymous_client();
        let task = new_task(client, &format!("{base}/ok"));
        let (tx, rx) = mpsc::channel::<Outcome>();

        let code = st_task_execute(task, Some(record), &tx as *const _ as *mut c_void);
        assert_eq!(code, FfiErrorCode::Ok);

        let outcome = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(outcome.data, b"ok");
        assert_eq!(outcome.status, Some(200));
        assert!(outcome.error.is_none());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(st_task_state(task), FfiTaskState::Completed);

        let again = st_task_execute(task, Some(record), &tx as *const _ as *mut c_void);
        assert_eq!(again, FfiErrorCode::AlreadyExecuted);

        st_task_free(task);
        st_client_free(client);
    }

    #[test]
    fn protocol_error_carries_response() {
        let base = start_server();
        let client = anonymous_client();
        let task = new_task(client, &format!("{base}/files/missing.bin"));
        let (tx, rx) = mpsc::channel::<Outcome>();

        st_task_execute(task, Some(record), &tx as *const _ as *mut c_void);
        let outcome = rx.recv_timeout(Duration::from_secs(10)).unwrap();

        assert_eq!(outcome.error, Some(FfiErrorCode::Protocol));
        assert_eq!(outcome.status, Some(404));
        assert_eq!(outcome.message.as_deref(), Some("HTTP 404"));

        st_task_free(task);
        st_client_free(client);
    }

    #[test]
    fn cancel_delivers_cancelled_error() {
        let base = start_server();
        let client = anonymous_client();
        let task = new_task(client, &format!("{base}/slow?ms=5000"));
        let (tx, rx) = mpsc::channel::<Outcome>();

        st_task_execute(task, Some(record), &tx as *const _ as *mut c_void);
        st_task_cancel(task);

        let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(outcome.error, Some(FfiErrorCode::Cancelled));
        assert!(outcome.status.is_none());
        assert!(outcome.data.is_empty());
        assert_eq!(st_task_state(task), FfiTaskState::Cancelled);

        st_task_cancel(task);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        st_task_free(task);
        st_client_free(client);
    }

    #[test]
    fn null_handles_are_safe() {
        st_task_cancel(std::ptr::null());
        st_task_free(std::ptr::null_mut());
        st_request_free(std::ptr::null_mut());
        assert_eq!(st_task_state(std::ptr::null()), FfiTaskState::Invalid);
    }
}
