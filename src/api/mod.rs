// HTTP API routes (context updates, session inspection, health, metrics).

pub mod ws;

use axum::{
    extract::{Json, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tower_http::cors::CorsLayer;

use crate::inference::{infer_with_timeout, InferenceError, InferenceProvider, InferenceResponse};
use crate::metrics;
use crate::protocol::{update_from_value, PayloadError};
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::session::SessionStore;
use crate::snapshot::{ReconcileError, ReconcileWarning, Update};

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub provider: Arc<dyn InferenceProvider>,
    pub rate_limiter: RateLimiter,
    pub inference_timeout: Duration,
}

// ── Errors ────────────────────────────────────────────────────────────

/// Anything that can fail a context update.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("session '{0}' is already bound to a live WebSocket")]
    SessionInUse(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Payload(_) => StatusCode::BAD_REQUEST,
            ApiError::Reconcile(ReconcileError::MissingBaseState) => StatusCode::CONFLICT,
            ApiError::Reconcile(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Inference(InferenceError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Inference(_) => StatusCode::BAD_GATEWAY,
            ApiError::SessionInUse(_) => StatusCode::CONFLICT,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Payload(_) => "invalid_payload",
            ApiError::Reconcile(e) => e.kind(),
            ApiError::RateLimited(_) => "rate_limited",
            ApiError::Inference(e) => e.kind(),
            ApiError::SessionInUse(_) => "session_in_use",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        json_error(self.status(), self.kind(), &self.to_string()).into_response()
    }
}

fn json_error(status: StatusCode, kind: &str, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg, "kind": kind })))
}

// ── Context updates ───────────────────────────────────────────────────

/// Reply to a successful context update.
#[derive(Debug, Clone, Serialize)]
pub struct ContextReply {
    pub session_id: String,
    pub warnings: Vec<ReconcileWarning>,
    pub response: InferenceResponse,
}

/// Reconcile an update into the session cache, then run inference on the result.
///
/// The reconciled snapshot stays cached even if inference fails or times out.
pub async fn apply_update(
    state: &AppState,
    session_id: &str,
    update: Update,
) -> Result<ContextReply, ApiError> {
    state.rate_limiter.check(session_id)?;

    let reconciled = state.sessions.reconcile(session_id, update).await?;
    let response =
        infer_with_timeout(&state.provider, &reconciled.snapshot, state.inference_timeout).await?;

    Ok(ContextReply {
        session_id: session_id.to_string(),
        warnings: reconciled.warnings,
        response,
    })
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/metrics", get(metrics_text))
        // Sessions
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", delete(delete_session))
        .route(
            "/api/sessions/{id}/context",
            post(post_context).get(get_context),
        )
        // WebSocket
        .route("/ws", get(ws::ws_session))
        .with_state(state)
        .layer(middleware::from_fn(track_metrics))
        .layer(CorsLayer::permissive())
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let start = Instant::now();

    let response = next.run(req).await;

    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), endpoint.as_str(), response.status().as_str()])
        .inc();
    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint.as_str()])
        .observe(start.elapsed().as_secs_f64());
    response
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "statebridge-backend" }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "sessions": state.sessions.len(),
        "provider": state.provider.name(),
    }))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.list().await;
    (StatusCode::OK, Json(json!({ "sessions": sessions })))
}

async fn post_context(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let update = match update_from_value(payload) {
        Ok(update) => update,
        Err(e) => return ApiError::from(e).into_response(),
    };
    match apply_update(&state, &session_id, update).await {
        Ok(reply) => (StatusCode::OK, Json(json!(reply))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_context(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.snapshot(&session_id).await {
        Some(snapshot) => (StatusCode::OK, Json(json!(snapshot))).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "not_found", "Session has no snapshot")
            .into_response(),
    }
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    state.rate_limiter.release(&session_id);
    if state.sessions.remove(&session_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        json_error(StatusCode::NOT_FOUND, "not_found", "Session not found").into_response()
    }
}
