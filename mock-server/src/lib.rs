use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub const INITIAL_REFRESH_TOKEN: &str = "refresh-0";

/// Shared server state. Exposed so tests can seed tokens and read counters.
#[derive(Debug)]
pub struct MockState {
    valid_token: RwLock<String>,
    refresh_token: RwLock<String>,
    refresh_count: AtomicUsize,
    request_count: AtomicUsize,
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MockState {
    pub fn new(valid_token: &str) -> Arc<Self> {
        Arc::new(Self {
            valid_token: RwLock::new(valid_token.to_string()),
            refresh_token: RwLock::new(INITIAL_REFRESH_TOKEN.to_string()),
            refresh_count: AtomicUsize::new(0),
            request_count: AtomicUsize::new(0),
            files: RwLock::new(HashMap::new()),
        })
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Requests seen by the bearer-protected `/me` endpoint.
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub async fn valid_token(&self) -> String {
        self.valid_token.read().await.clone()
    }

    /// Invalidate the current token so the next protected call gets a 401.
    pub async fn expire_token(&self) {
        *self.valid_token.write().await = format!("revoked-{}", Uuid::new_v4());
    }

    pub async fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.read().await.get(name).cloned()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    pub grant_type: String,
    pub refresh_token: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Stats {
    pub refresh_count: usize,
    pub request_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Stored {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Deserialize)]
pub struct SlowParams {
    #[serde(default = "default_delay_ms")]
    pub ms: u64,
}

fn default_delay_ms() -> u64 {
    1_000
}

pub fn app() -> Router {
    app_with_state(MockState::new("token-0"))
}

pub fn app_with_state(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/ok", get(ok))
        .route("/me", get(me))
        .route("/oauth2/token", post(token))
        .route("/slow", get(slow))
        .route("/files/{name}", get(download).put(upload))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, MockState::new("token-0")).await
}

pub async fn run_with_state(
    listener: TcpListener,
    state: Arc<MockState>,
) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

async fn ok() -> &'static str {
    "ok"
}

async fn me(State(state): State<Arc<MockState>>, headers: HeaderMap) -> impl IntoResponse {
    state.request_count.fetch_add(1, Ordering::SeqCst);
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let valid = state.valid_token.read().await;
    if presented != Some(valid.as_str()) {
        debug!(?presented, "rejecting stale token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": {
                    "code": "InvalidAuthenticationToken",
                    "message": "Access token has expired."
                }
            })),
        )
            .into_response();
    }
    Json(Profile {
        id: "00000000-0000-0000-0000-000000000001".to_string(),
        display_name: "Megan Bowen".to_string(),
    })
    .into_response()
}

async fn token(
    State(state): State<Arc<MockState>>,
    Form(form): Form<TokenForm>,
) -> Result<Json<TokenResponse>, StatusCode> {
    if form.grant_type != "refresh_token" {
        return Err(StatusCode::BAD_REQUEST);
    }
    let mut current_refresh = state.refresh_token.write().await;
    if form.refresh_token != *current_refresh {
        return Err(StatusCode::BAD_REQUEST);
    }
    let n = state.refresh_count.fetch_add(1, Ordering::SeqCst) + 1;
    let access_token = format!("token-{n}");
    *current_refresh = format!("refresh-{n}");
    *state.valid_token.write().await = access_token.clone();
    info!(client_id = ?form.client_id, n, "issued access token");
    Ok(Json(TokenResponse {
        access_token,
        refresh_token: current_refresh.clone(),
        token_type: "Bearer".to_string(),
    }))
}

async fn slow(Query(params): Query<SlowParams>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    "slow"
}

async fn upload(
    State(state): State<Arc<MockState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<Stored>) {
    let size = body.len();
    state.files.write().await.insert(name.clone(), body.to_vec());
    (StatusCode::CREATED, Json(Stored { name, size }))
}

async fn download(
    State(state): State<Arc<MockState>>,
    Path(name): Path<String>,
) -> Result<Vec<u8>, StatusCode> {
    state.files.read().await.get(&name).cloned().ok_or(StatusCode::NOT_FOUND)
}

async fn stats(State(state): State<Arc<MockState>>) -> Json<Stats> {
    Json(Stats {
        refresh_count: state.refresh_count(),
        request_count: state.request_count(),
    })
}
