//! Asynchronous request tasks with transparent credential refresh.
//!
//! # Overview
//! A `RequestTask` binds one `HttpRequest` to a shared client, runs it once
//! on the tokio runtime and reports the outcome to a completion handler
//! exactly once. If the client reports an expired credential the task
//! refreshes it and re-issues the request before reporting, so callers see
//! a single outcome either way.
//!
//! # Design
//! - `Dispatch` is the client capability a task depends on; `HttpClient`
//!   implements it over a `Transport` (reqwest by default) and an optional
//!   `AuthProvider`.
//! - `RefreshPolicy` is the bounded refresh-and-retry wrapper around a
//!   dispatch; the default allows one refresh.
//! - `UploadTask` and `DownloadTask` reuse the same lifecycle for file
//!   bodies.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod refresh;
pub mod task;
pub mod transfer;
pub mod transport;

pub use auth::{AuthProvider, Credential, RefreshTokenProvider, StaticToken};
pub use client::{Dispatch, HttpClient};
pub use config::ClientConfig;
pub use error::TaskError;
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use refresh::RefreshPolicy;
pub use task::{
    Completion, DownloadCompletionHandler, HttpRequestCompletionHandler, RequestTask, TaskHandle,
    TaskResult, TaskState, UploadCompletionHandler,
};
pub use transfer::{DownloadTask, DownloadedFile, UploadTask};
pub use transport::{
    RawDownloadCompletionHandler, RawUploadCompletionHandler, ReqwestTransport, Transport,
};
