//! Credential providers used by `HttpClient`.
//!
//! A provider hands out the current access token and, when asked, performs
//! one refresh round trip through the client's transport. Tokens are kept
//! behind a `RwLock` so every task sharing the client sees a refreshed
//! token as soon as the refresh completes.
//!
//! Each token carries a generation that advances on every refresh. A
//! refresh names the generation that was rejected; if the provider has
//! already moved past it, the current token is returned without another
//! round trip.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::TaskError;
use crate::http::{HttpMethod, HttpRequest};
use crate::transport::Transport;

/// A bearer token and the refresh generation that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub generation: u64,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("generation", &self.generation)
            .finish()
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Token to attach as `Authorization: Bearer <token>`.
    async fn credential(&self) -> Result<Credential, TaskError>;

    /// Replace the credential of generation `stale`, or the current one
    /// when `stale` is `None`.
    async fn refresh(
        &self,
        transport: &dyn Transport,
        stale: Option<u64>,
    ) -> Result<Credential, TaskError>;
}

/// A fixed token that cannot be refreshed.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticToken {
    async fn credential(&self) -> Result<Credential, TaskError> {
        Ok(Credential {
            token: self.token.clone(),
            generation: 0,
        })
    }

    async fn refresh(
        &self,
        _transport: &dyn Transport,
        _stale: Option<u64>,
    ) -> Result<Credential, TaskError> {
        Err(TaskError::Authentication(
            "static token cannot be refreshed".to_string(),
        ))
    }
}

/// Refreshes with an OAuth2 `refresh_token` grant against a token endpoint.
#[derive(Debug)]
pub struct RefreshTokenProvider {
    token_url: String,
    client_id: String,
    state: RwLock<TokenState>,
}

#[derive(Debug)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: String,
    generation: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl RefreshTokenProvider {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            state: RwLock::new(TokenState {
                access_token: None,
                refresh_token: refresh_token.into(),
                generation: 0,
            }),
        }
    }

    /// Seed the provider with an access token obtained elsewhere.
    pub fn with_access_token(self, token: impl Into<String>) -> Self {
        let mut state = self.state.into_inner();
        state.access_token = Some(token.into());
        Self {
            token_url: self.token_url,
            client_id: self.client_id,
            state: RwLock::new(state),
        }
    }

    fn refresh_request(&self, refresh_token: &str) -> HttpRequest {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", refresh_token)
            .append_pair("client_id", &self.client_id)
            .finish();
        HttpRequest::new(HttpMethod::Post, self.token_url.clone())
            .with_header("content-type", "application/x-www-form-urlencoded")
            .with_header("accept", "application/json")
            .with_body(body)
    }
}

#[async_trait]
impl AuthProvider for RefreshTokenProvider {
    async fn credential(&self) -> Result<Credential, TaskError> {
        let state = self.state.read().await;
        match &state.access_token {
            Some(token) => Ok(Credential {
                token: token.clone(),
                generation: state.generation,
            }),
            None => Err(TaskError::CredentialExpired {
                response: None,
                generation: Some(state.generation),
            }),
        }
    }

    async fn refresh(
        &self,
        transport: &dyn Transport,
        stale: Option<u64>,
    ) -> Result<Credential, TaskError> {
        // Held across the round trip so concurrent refreshes queue up.
        let mut state = self.state.write().await;
        if let (Some(stale), Some(token)) = (stale, &state.access_token) {
            if stale != state.generation {
                debug!(stale, current = state.generation, "token already refreshed");
                return Ok(Credential {
                    token: token.clone(),
                    generation: state.generation,
                });
            }
        }
        debug!(token_url = %self.token_url, "refreshing access token");

        let response = transport
            .send(self.refresh_request(&state.refresh_token))
            .await?;
        if !response.is_success() {
            return Err(TaskError::Authentication(format!(
                "token endpoint returned HTTP {}",
                response.status
            )));
        }
        let token: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| TaskError::Authentication(format!("malformed token response: {e}")))?;

        state.access_token = Some(token.access_token.clone());
        if let Some(rotated) = token.refresh_token {
            state.refresh_token = rotated;
        }
        state.generation += 1;
        info!(generation = state.generation, "access token refreshed");
        Ok(Credential {
            token: token.access_token,
            generation: state.generation,
        })
    }
}
