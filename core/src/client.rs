//! The client capability a task dispatches through.
//!
//! # Design
//! `Dispatch` is the seam between a `RequestTask` and whatever sends its
//! request: `HttpClient` in production, a scripted mock in tests. The task
//! never looks at status codes; it only asks the client to dispatch and,
//! when the client reports `CredentialExpired`, to refresh.
//!
//! `HttpClient` is stateless apart from its shared credential provider, so
//! one instance can back any number of concurrent tasks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::config::ClientConfig;
use crate::error::TaskError;
use crate::http::{HttpRequest, HttpResponse};
use crate::refresh::RefreshPolicy;
use crate::transport::{ReqwestTransport, Transport};

const REQUEST_ID_HEADER: &str = "client-request-id";

#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Perform the exchange described by `request`.
    async fn dispatch(&self, request: &HttpRequest) -> Result<HttpResponse, TaskError>;

    /// Replace the credential rejected with `expired`. Called at most once
    /// per expired dispatch.
    async fn refresh_credential(&self, expired: &TaskError) -> Result<(), TaskError>;

    /// Policy new tasks on this client start with.
    fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy::default()
    }
}

/// Dispatches requests over a `Transport`, attaching a bearer credential.
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    auth: Option<Arc<dyn AuthProvider>>,
    config: ClientConfig,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Result<Self, TaskError> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            auth: None,
            config,
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Copy `request` with client headers applied. Also returns the
    /// generation of the attached credential, if any.
    async fn prepare(
        &self,
        request: &HttpRequest,
    ) -> Result<(HttpRequest, Option<u64>), TaskError> {
        let mut prepared = request.clone();
        for (name, value) in &self.config.default_headers {
            if prepared.header(name).is_none() {
                prepared.headers.push((name.clone(), value.clone()));
            }
        }
        if prepared.header("user-agent").is_none() {
            prepared
                .headers
                .push(("user-agent".to_string(), self.config.user_agent.clone()));
        }
        prepared.set_header(REQUEST_ID_HEADER, Uuid::new_v4().to_string());
        let mut generation = None;
        if let Some(auth) = &self.auth {
            let credential = auth.credential().await?;
            prepared.set_header("authorization", format!("Bearer {}", credential.token));
            generation = Some(credential.generation);
        }
        Ok((prepared, generation))
    }

    fn interpret(
        &self,
        response: HttpResponse,
        generation: Option<u64>,
    ) -> Result<HttpResponse, TaskError> {
        if response.status == 401 && self.auth.is_some() {
            debug!(?generation, "server rejected credential");
            return Err(TaskError::CredentialExpired {
                response: Some(Box::new(response)),
                generation,
            });
        }
        if !response.is_success() && self.config.status_as_error {
            return Err(TaskError::Protocol {
                response: Box::new(response),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Dispatch for HttpClient {
    async fn dispatch(&self, request: &HttpRequest) -> Result<HttpResponse, TaskError> {
        let (prepared, generation) = self.prepare(request).await?;
        let response = self.transport.send(prepared).await?;
        self.interpret(response, generation)
    }

    async fn refresh_credential(&self, expired: &TaskError) -> Result<(), TaskError> {
        let Some(auth) = &self.auth else {
            warn!("credential refresh requested without an auth provider");
            return Err(TaskError::Authentication(
                "no auth provider configured".to_string(),
            ));
        };
        let stale = match expired {
            TaskError::CredentialExpired { generation, .. } => *generation,
            _ => None,
        };
        auth.refresh(self.transport.as_ref(), stale).await.map(|_| ())
    }

    fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy::default().with_max_refreshes(self.config.max_credential_refreshes)
    }
}
