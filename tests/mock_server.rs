/// Mock application backend issuing CSRF tokens and enforcing them on writes
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

#[derive(Default)]
struct BackendState {
    issued: AtomicUsize,
    current: Mutex<Option<String>>,
    fail_tokens: AtomicBool,
    expires_in: Mutex<i64>,
}

#[derive(Clone)]
pub struct MockServer {
    pub port: u16,
    state: Arc<BackendState>,
    shutdown_tx: Arc<tokio::sync::Mutex<Option<oneshot::Sender<()>>>>,
}

#[allow(dead_code)]
impl MockServer {
    /// Start a new mock server on a random available port
    pub async fn start() -> anyhow::Result<Self> {
        let state = Arc::new(BackendState {
            expires_in: Mutex::new(3600),
            ..BackendState::default()
        });

        let app = Router::new()
            .route("/api/csrf-token", axum::routing::get(handle_token))
            .route(
                "/api/echo",
                axum::routing::post(handle_echo).get(handle_echo),
            )
            .route("/large", axum::routing::get(handle_large))
            .with_state(state.clone());

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed to start");
        });

        Ok(Self {
            port,
            state,
            shutdown_tx: Arc::new(tokio::sync::Mutex::new(Some(shutdown_tx))),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    /// Number of tokens handed out so far
    pub fn tokens_issued(&self) -> usize {
        self.state.issued.load(Ordering::SeqCst)
    }

    pub fn current_token(&self) -> Option<String> {
        self.state.current.lock().unwrap().clone()
    }

    /// Forget the issued token so the next write is rejected
    pub fn rotate(&self) {
        *self.state.current.lock().unwrap() = Some("rotated-server-side".to_string());
    }

    pub fn fail_token_requests(&self, fail: bool) {
        self.state.fail_tokens.store(fail, Ordering::SeqCst);
    }

    pub fn set_expires_in(&self, seconds: i64) {
        *self.state.expires_in.lock().unwrap() = seconds;
    }

    /// Shutdown the server
    pub async fn shutdown(self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_token(State(state): State<Arc<BackendState>>) -> Response {
    if state.fail_tokens.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "token service down").into_response();
    }

    let n = state.issued.fetch_add(1, Ordering::SeqCst);
    let token = format!("token-{}", n + 1);
    *state.current.lock().unwrap() = Some(token.clone());
    let expires_in = *state.expires_in.lock().unwrap();

    Json(json!({ "csrf_token": token, "expires_in": expires_in })).into_response()
}

async fn handle_echo(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let sent = headers
        .get("x-csrf-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let expected = state.current.lock().unwrap().clone();

    if sent.is_none() || sent != expected {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Invalid CSRF token" })),
        )
            .into_response();
    }

    Json(json!({
        "headers": extract_headers(&headers),
        "json": serde_json::from_str::<Value>(&body).ok(),
        "data": body,
    }))
    .into_response()
}

async fn handle_large() -> String {
    "x".repeat(64 * 1024)
}

fn extract_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect()
}
