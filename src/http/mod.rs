//! REST endpoints for the intake pipeline.
//!
//! Session management lives in the outer application; here a pair of
//! configured bearer tokens stands in for the admin and manager roles.
//! No token configured means the protected routes deny, never open up.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::config::{HttpConfig, PipelineConfig};
use crate::connector::MailboxConnector;
use crate::error::ConnectorError;
use crate::pipeline::{Orchestrator, ParsedEmail};
use crate::store::IntakeStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn IntakeStore>,
    pub connector: Arc<dyn MailboxConnector>,
    pub defaults: PipelineConfig,
    pub auth: AuthTokens,
}

/// Bearer tokens for the two calling roles.
#[derive(Clone, Default)]
pub struct AuthTokens {
    pub admin: Option<String>,
    pub manager: Option<String>,
}

impl From<&HttpConfig> for AuthTokens {
    fn from(config: &HttpConfig) -> Self {
        Self {
            admin: config.admin_token.clone(),
            manager: config.manager_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Admin,
    /// Manager or admin.
    Manager,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

/// Check the bearer token against the required role.
fn authorize(auth: &AuthTokens, headers: &HeaderMap, role: Role) -> Result<(), ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing bearer token"})),
        ));
    };

    let is_admin = auth.admin.as_deref() == Some(token);
    let is_manager = auth.manager.as_deref() == Some(token);

    let allowed = match role {
        Role::Admin => is_admin,
        Role::Manager => is_admin || is_manager,
    };

    if allowed {
        Ok(())
    } else if is_manager {
        Err((
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Admin role required"})),
        ))
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid token"})),
        ))
    }
}

/// Build the intake REST routes.
pub fn intake_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/admin/gmail/auth", get(gmail_auth))
        .route("/api/admin/gmail/callback", get(gmail_callback))
        .route("/api/admin/gmail/status", get(gmail_status))
        .route("/api/admin/emails/fetch", post(fetch_emails))
        .route("/api/admin/emails/queue", get(list_queue))
        .route("/api/admin/emails/process-queue", post(process_queue))
        .route("/api/admin/emails/stats", get(stats))
        .route("/api/emails/parse", post(parse_email))
        .route("/api/emails/process", post(process_email))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn internal_error(e: impl std::fmt::Display) -> ApiError {
    error!("Request failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "freight-intake"}))
}

// ── Mailbox authorization ───────────────────────────────────────────

/// GET /api/admin/gmail/auth — start the authorization flow.
async fn gmail_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state.auth, &headers, Role::Admin)?;

    if !state.connector.is_configured() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "Mailbox connector not configured",
                "message": "Set GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
            })),
        ));
    }

    let auth_url = state.connector.auth_url().map_err(internal_error)?;
    Ok(Json(json!({
        "authUrl": auth_url,
        "message": "Redirect the admin to this URL to authorize mailbox access",
    })))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

/// GET /api/admin/gmail/callback — exchange the provider auth code.
async fn gmail_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state.auth, &headers, Role::Admin)?;

    if let Some(error) = params.error {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Authorization denied", "details": error})),
        ));
    }

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Authorization code required"})),
        ));
    };

    match state.connector.exchange_code(&code).await {
        Ok(()) => Ok(Json(json!({"success": true, "message": "Mailbox connected"}))),
        Err(ConnectorError::NotConfigured { .. }) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Mailbox connector not configured"})),
        )),
        Err(e) => Err(internal_error(e)),
    }
}

/// GET /api/admin/gmail/status
async fn gmail_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state.auth, &headers, Role::Admin)?;
    let status = state.connector.status().await.map_err(internal_error)?;
    Ok(Json(status))
}

// ── Fetch & queue ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchRequest {
    max_results: Option<u32>,
}

/// POST /api/admin/emails/fetch — trigger a mailbox fetch.
async fn fetch_emails(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FetchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state.auth, &headers, Role::Admin)?;

    let status = state.connector.status().await.map_err(internal_error)?;
    if !status.connected {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Mailbox not connected",
                "message": "Authorize mailbox access first at /api/admin/gmail/auth",
            })),
        ));
    }

    let max_results = request.max_results.unwrap_or(10);

    let report = state
        .orchestrator
        .fetch_and_queue(max_results)
        .await
        .map_err(internal_error)?;
    Ok(Json(report))
}

/// GET /api/admin/emails/queue
async fn list_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state.auth, &headers, Role::Admin)?;
    let emails = state.store.list_pending().await.map_err(internal_error)?;
    Ok(Json(json!({
        "pending": emails.len(),
        "emails": emails,
    })))
}

// ── Manual parse / process ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManualEmailRequest {
    from: Option<String>,
    subject: Option<String>,
    body: Option<String>,
    date: Option<DateTime<Utc>>,
    auto_create: Option<bool>,
    min_confidence: Option<u8>,
}

/// Validate required fields before any external call.
fn parsed_from_request(request: ManualEmailRequest) -> Result<(ParsedEmail, ManualOptions), ApiError> {
    let subject = request.subject.filter(|s| !s.trim().is_empty());
    let body = request.body.filter(|s| !s.trim().is_empty());
    let (Some(subject), Some(body)) = (subject, body) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Subject and body are required"})),
        ));
    };

    let options = ManualOptions {
        auto_create: request.auto_create,
        min_confidence: request.min_confidence,
    };
    Ok((
        ParsedEmail::manual(request.from, subject, body, request.date),
        options,
    ))
}

struct ManualOptions {
    auto_create: Option<bool>,
    min_confidence: Option<u8>,
}

/// POST /api/emails/parse — preview extraction, never creates a booking.
async fn parse_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ManualEmailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state.auth, &headers, Role::Manager)?;

    let (parsed, _) = parsed_from_request(request)?;

    let result = state
        .orchestrator
        .process_one(&parsed, false, state.defaults.min_confidence)
        .await;
    Ok(Json(result))
}

/// POST /api/emails/process — process one email, optionally auto-creating.
async fn process_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ManualEmailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state.auth, &headers, Role::Admin)?;

    let (parsed, options) = parsed_from_request(request)?;

    let auto_create = options.auto_create.unwrap_or(state.defaults.auto_create);
    let min_confidence = options
        .min_confidence
        .map(|c| c.min(100))
        .unwrap_or(state.defaults.min_confidence);

    let result = state
        .orchestrator
        .process_one(&parsed, auto_create, min_confidence)
        .await;
    Ok(Json(result))
}

// ── Backlog & stats ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessQueueRequest {
    auto_create: Option<bool>,
    min_confidence: Option<u8>,
}

/// POST /api/admin/emails/process-queue — run the whole backlog.
async fn process_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ProcessQueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state.auth, &headers, Role::Admin)?;

    let auto_create = request.auto_create.unwrap_or(state.defaults.auto_create);
    let min_confidence = request
        .min_confidence
        .map(|c| c.min(100))
        .unwrap_or(state.defaults.min_confidence);

    let (summary, results) = state
        .orchestrator
        .process_backlog(auto_create, min_confidence)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "summary": summary,
        "results": results,
    })))
}

/// GET /api/admin/emails/stats
async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state.auth, &headers, Role::Manager)?;
    let stats = state.store.processing_stats().await.map_err(internal_error)?;
    Ok(Json(stats))
}
