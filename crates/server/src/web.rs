use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use periscope_protocol::{LoginRequest, LoginResponse, PeriscopeConfig, SecurityConfig, valid_username};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::auth::AuthError;
use crate::channel::WebSocketChannel;
use crate::negotiation::PeerNegotiatorFactory;
use crate::registry::RegistryError;
use crate::session::{self, SessionContext};

/// Upper bound on blocking credential checks (PAM can hang on broken
/// LDAP/SSSD backends).
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state.
pub struct AppState {
    pub config: PeriscopeConfig,
    pub sessions: Arc<SessionContext<PeerNegotiatorFactory>>,
    pub login_limiter: LoginRateLimiter,
    pub started_at: std::time::Instant,
}

/// Sliding-window limiter for login attempts, keyed by username.
/// The number of tracked keys is capped; expired entries are swept every
/// `ttl_cleanup_interval` calls.
pub struct LoginRateLimiter {
    attempts: std::sync::Mutex<std::collections::HashMap<String, Vec<std::time::Instant>>>,
    max_attempts: usize,
    window: Duration,
    max_keys: usize,
    call_count: std::sync::atomic::AtomicU64,
    ttl_cleanup_interval: u64,
}

impl LoginRateLimiter {
    pub fn new(max_attempts: usize, window_secs: u64) -> Self {
        Self {
            attempts: std::sync::Mutex::new(std::collections::HashMap::new()),
            max_attempts,
            window: Duration::from_secs(window_secs),
            max_keys: 10_000,
            call_count: std::sync::atomic::AtomicU64::new(0),
            ttl_cleanup_interval: 100,
        }
    }

    /// Record an attempt for `key`. Returns false if the key is over its
    /// limit for the current window.
    pub fn check(&self, key: &str) -> bool {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = std::time::Instant::now();

        let count = self
            .call_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if count.is_multiple_of(self.ttl_cleanup_interval) || attempts.len() > self.max_keys / 2 {
            attempts.retain(|_k, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < self.window);
                !timestamps.is_empty()
            });
        }

        if attempts.len() >= self.max_keys && !attempts.contains_key(key) {
            return false;
        }

        let entry = attempts.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() >= self.max_attempts {
            return false;
        }
        entry.push(now);
        true
    }

    /// Forget `key`, e.g. after a successful login.
    pub fn clear(&self, key: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(key);
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.len()
    }

    #[cfg(test)]
    fn with_cleanup_interval(mut self, interval: u64) -> Self {
        self.ttl_cleanup_interval = interval;
        self
    }
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );

    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/login", post(login))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(terminate_session))
        .route("/api/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .layer(RequestBodyLimitLayer::new(65_536))
        .with_state(Arc::clone(&state));

    let serve_dir = ServeDir::new(&state.config.server.web_root);

    api.fallback_service(serve_dir)
        .layer(axum::middleware::from_fn(security_headers))
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Resolve the caller from `Authorization: Bearer`, falling back to the
/// `token` query parameter.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query: &TokenQuery,
) -> Result<String, (StatusCode, Json<serde_json::Value>)> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query.token.as_deref())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Missing token" })),
            )
        })?;

    state.sessions.authenticator.validate_token(token).map_err(|e| {
        tracing::warn!("Rejected bearer token: {e}");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid or expired token" })),
        )
    })
}

/// Whether a WebSocket upgrade's `Origin` is acceptable. Requests without an
/// `Origin` header are not from a browser and pass.
pub fn origin_allowed(headers: &HeaderMap, security: &SecurityConfig) -> bool {
    if !security.check_origin {
        return true;
    }
    let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) else {
        return true;
    };
    if security
        .additional_origins
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(origin))
    {
        return true;
    }
    let origin_host = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let origin_host = origin_host.trim_end_matches('/');
    headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|host| host.eq_ignore_ascii_case(origin_host))
}

/// POST /api/login
async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    tracing::info!(username = %req.username, "Login request");

    if !valid_username(&req.username) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid username" })),
        )
            .into_response();
    }

    if !state.login_limiter.check(&req.username) {
        tracing::warn!(target: "audit", event = "rate_limited", username = %req.username, "Login rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Too many login attempts. Please try again later." })),
        )
            .into_response();
    }

    let authenticator = Arc::clone(&state.sessions.authenticator);
    let username = req.username.clone();
    let password = req.password;
    let result = tokio::time::timeout(
        AUTH_TIMEOUT,
        tokio::task::spawn_blocking(move || authenticator.authenticate(&username, &password)),
    )
    .await;

    match result {
        Err(_) => {
            tracing::warn!(username = %req.username, "Authentication timed out");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "error": "Authentication timed out" })),
            )
                .into_response()
        }
        Ok(Ok(Ok(token))) => {
            state.login_limiter.clear(&req.username);
            tracing::info!(target: "audit", event = "login_success", username = %req.username, "User logged in");
            Json(LoginResponse { token }).into_response()
        }
        Ok(Ok(Err(AuthError::InvalidCredentials))) => {
            tracing::info!(target: "audit", event = "login_failure", username = %req.username, "Login failed");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid username or password" })),
            )
                .into_response()
        }
        Ok(Ok(Err(e))) => {
            tracing::error!("Failed to issue token: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("Authentication task panicked: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response()
        }
    }
}

/// GET /ws - control channel. Authentication happens in-band.
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !origin_allowed(&headers, &state.config.security) {
        tracing::warn!(
            origin = ?headers.get("origin"),
            host = ?headers.get("host"),
            "WebSocket origin rejected"
        );
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    tracing::info!("Control WebSocket upgrade");
    let ctx = Arc::clone(&state.sessions);
    ws.max_message_size(65_536)
        .on_upgrade(move |socket| session::serve(ctx, WebSocketChannel::new(socket)))
        .into_response()
}

fn registry_error(e: RegistryError) -> axum::response::Response {
    let status = match e {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Full(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// GET /api/sessions
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers, &query) {
        return rejection.into_response();
    }
    Json(state.sessions.registry.list().await).into_response()
}

/// GET /api/sessions/{id}
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers, &query) {
        return rejection.into_response();
    }
    match state.sessions.registry.get(id).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => registry_error(e),
    }
}

/// DELETE /api/sessions/{id} - force-terminate a live session
async fn terminate_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let caller = match authorize(&state, &headers, &query) {
        Ok(caller) => caller,
        Err(rejection) => return rejection.into_response(),
    };
    match state.sessions.registry.terminate(id).await {
        Ok(()) => {
            tracing::info!(target: "audit", event = "session_terminated", %id, by = %caller, "Session terminated");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => registry_error(e),
    }
}

/// GET /api/health - liveness, no auth
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}
