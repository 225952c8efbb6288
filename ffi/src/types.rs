//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Handles (`FfiClient`, `FfiRequest`, `FfiTask`) are opaque to C. Values
//! passed to the completion callback (`FfiResponse`, `FfiError`) borrow
//! storage owned by this module for the duration of the call only; C code
//! must copy anything it wants to keep before returning.

use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::sync::Arc;

use session_task::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, RequestTask, TaskError, TaskResult,
    TaskState,
};

/// Opaque handle to a shared `HttpClient`.
pub struct FfiClient {
    pub(crate) inner: Arc<HttpClient>,
}

/// Opaque request under construction. Copied into a task by `st_task_new`.
pub struct FfiRequest {
    pub(crate) inner: HttpRequest,
}

/// Opaque handle to a `RequestTask`.
pub struct FfiTask {
    pub(crate) inner: RequestTask,
}

/// HTTP method as a C enum.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiHttpMethod {
    Get = 0,
    Post = 1,
    Put = 2,
    Patch = 3,
    Delete = 4,
    Head = 5,
}

impl From<FfiHttpMethod> for HttpMethod {
    fn from(m: FfiHttpMethod) -> Self {
        match m {
            FfiHttpMethod::Get => HttpMethod::Get,
            FfiHttpMethod::Post => HttpMethod::Post,
            FfiHttpMethod::Put => HttpMethod::Put,
            FfiHttpMethod::Patch => HttpMethod::Patch,
            FfiHttpMethod::Delete => HttpMethod::Delete,
            FfiHttpMethod::Head => HttpMethod::Head,
        }
    }
}

/// Task lifecycle as seen from C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiTaskState {
    Idle = 0,
    InFlight = 1,
    Completed = 2,
    Cancelled = 3,
    /// Returned for a null task pointer.
    Invalid = 4,
}

impl From<TaskState> for FfiTaskState {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Idle => FfiTaskState::Idle,
            TaskState::InFlight => FfiTaskState::InFlight,
            TaskState::Completed => FfiTaskState::Completed,
            TaskState::Cancelled => FfiTaskState::Cancelled,
        }
    }
}

/// Error codes returned synchronously and passed to the completion callback.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    InvalidRequest = 1,
    InvalidConfig = 2,
    AlreadyExecuted = 3,
    NoRuntime = 4,
    Transport = 5,
    Timeout = 6,
    Protocol = 7,
    CredentialExpired = 8,
    Authentication = 9,
    Cancelled = 10,
    Io = 11,
    NullArg = 12,
    Panic = 13,
}

impl From<&TaskError> for FfiErrorCode {
    fn from(err: &TaskError) -> Self {
        match err {
            TaskError::InvalidRequest(_) => FfiErrorCode::InvalidRequest,
            TaskError::InvalidConfig(_) => FfiErrorCode::InvalidConfig,
            TaskError::AlreadyExecuted => FfiErrorCode::AlreadyExecuted,
            TaskError::NoRuntime => FfiErrorCode::NoRuntime,
            TaskError::Transport(_) => FfiErrorCode::Transport,
            TaskError::Timeout => FfiErrorCode::Timeout,
            TaskError::Protocol { .. } => FfiErrorCode::Protocol,
            TaskError::CredentialExpired { .. } => FfiErrorCode::CredentialExpired,
            TaskError::Authentication(_) => FfiErrorCode::Authentication,
            TaskError::Cancelled => FfiErrorCode::Cancelled,
            TaskError::Io(_) => FfiErrorCode::Io,
        }
    }
}

/// A single HTTP header as a key-value pair of C strings.
#[repr(C)]
pub struct FfiHeader {
    pub key: *const c_char,
    pub value: *const c_char,
}

/// Response metadata passed to the completion callback.
#[repr(C)]
pub struct FfiResponse {
    pub status: u16,
    pub headers: *const FfiHeader,
    pub headers_len: u32,
}

/// Error passed to the completion callback.
#[repr(C)]
pub struct FfiError {
    pub code: FfiErrorCode,
    pub message: *const c_char,
}

/// Completion callback: `(user_data, data, data_len, response, error)`.
///
/// On success `error` is null and `data` points at the body. On failure
/// `error` is set; `response` and `data` are set only if the server
/// answered. All pointers are valid only until the callback returns.
pub type FfiCompletionCallback = extern "C" fn(
    user_data: *mut c_void,
    data: *const u8,
    data_len: usize,
    response: *const FfiResponse,
    error: *const FfiError,
);

/// Caller context carried to the runtime thread that completes the task.
pub(crate) struct UserData(*mut c_void);

// The C caller guarantees `user_data` stays valid, and is safe to use from
// another thread, until the callback has run.
unsafe impl Send for UserData {}

impl UserData {
    pub(crate) fn new(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub(crate) fn as_ptr(&self) -> *mut c_void {
        self.0
    }
}

/// C strings and header array backing one `FfiResponse`.
struct ResponseStorage {
    status: u16,
    _strings: Vec<CString>,
    headers: Vec<FfiHeader>,
}

impl ResponseStorage {
    fn new(response: &HttpResponse) -> Self {
        let mut strings = Vec::with_capacity(response.headers.len() * 2);
        let mut headers = Vec::with_capacity(response.headers.len());
        for (k, v) in &response.headers {
            let key = c_string(k);
            let value = c_string(v);
            // CString contents live on the heap, so moving them into
            // `strings` keeps these pointers valid.
            headers.push(FfiHeader {
                key: key.as_ptr(),
                value: value.as_ptr(),
            });
            strings.push(key);
            strings.push(value);
        }
        Self {
            status: response.status,
            _strings: strings,
            headers,
        }
    }

    fn as_ffi(&self) -> FfiResponse {
        FfiResponse {
            status: self.status,
            headers: if self.headers.is_empty() {
                std::ptr::null()
            } else {
                self.headers.as_ptr()
            },
            headers_len: self.headers.len() as u32,
        }
    }
}

/// Convert a task outcome to C values and invoke `callback` once.
pub(crate) fn deliver(callback: FfiCompletionCallback, user_data: *mut c_void, result: TaskResult) {
    match result {
        Ok(response) => {
            let storage = ResponseStorage::new(&response);
            let ffi_response = storage.as_ffi();
            callback(
                user_data,
                response.body.as_ptr(),
                response.body.len(),
                &ffi_response,
                std::ptr::null(),
            );
        }
        Err(err) => {
            let message = c_string(&err.to_string());
            let ffi_error = FfiError {
                code: FfiErrorCode::from(&err),
                message: message.as_ptr(),
            };
            let storage = err.response().map(ResponseStorage::new);
            let ffi_response = storage.as_ref().map(ResponseStorage::as_ffi);
            let (data, data_len) = match err.response() {
                Some(r) => (r.body.as_ptr(), r.body.len()),
                None => (std::ptr::null(), 0),
            };
            callback(
                user_data,
                data,
                data_len,
                ffi_response
                    .as_ref()
                    .map_or(std::ptr::null(), |r| r as *const FfiResponse),
                &ffi_error,
            );
        }
    }
}

/// Interior NUL bytes cannot cross the boundary; such strings become empty.
fn c_string(s: &str) -> CString {
    CString::new(s).unwrap_or_default()
}
