//! The networking layer that performs the byte-level HTTP exchange.
//!
//! # Design
//! `Transport` is the only place that touches the network. `HttpClient`
//! decorates requests and interprets responses on top of it, and the
//! credential refresh round trip goes through the same transport so it is
//! observable (and mockable) like any other request.

use async_trait::async_trait;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::TaskError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::transfer::DownloadedFile;

/// Provider-level handler for finished uploads.
pub type RawUploadCompletionHandler =
    Box<dyn FnOnce(Result<HttpResponse, TaskError>) + Send + 'static>;

/// Provider-level handler for finished downloads.
pub type RawDownloadCompletionHandler =
    Box<dyn FnOnce(Result<DownloadedFile, TaskError>) + Send + 'static>;

/// Executes one HTTP exchange. Never interprets the status code.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TaskError>;
}

/// `Transport` backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TaskError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| TaskError::InvalidConfig(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TaskError> {
        debug!(method = %request.method, url = %request.url, "sending request");

        let mut builder = self.client.request(to_reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        debug!(status, bytes = body.len(), "response received");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TaskError {
    if err.is_timeout() {
        TaskError::Timeout
    } else {
        TaskError::Transport(err.to_string())
    }
}
