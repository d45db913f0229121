//! REST API handlers for the trigger server
//!
//! Health and metrics are open. Every other route requires the shared
//! secret, sent as `x-cron-secret` or as a bearer token.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::scheduler::driver::{DriverStatus, TickReport};
use crate::scheduler::error::SchedulerError;
use crate::scheduler::finalizer::FinalizeReport;

use super::server::AppState;

/// Header carrying the shared secret
pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Optional body of a rotate trigger
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotateRequest {
    pub limit: Option<usize>,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub driver: DriverStatus,
    pub uptime_secs: u64,
}

/// Result of a cancel or resume request
#[derive(Debug, Serialize)]
pub struct CancellationResponse {
    pub campaign_id: Uuid,
    pub cancelled: bool,
    pub changed: bool,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Open endpoints
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics_text))
        // Trigger endpoints
        .route("/api/cron/rotate", post(trigger_rotate))
        .route("/api/cron/finalize", post(trigger_finalize))
        // Operator endpoints
        .route("/api/status", get(get_status))
        .route("/api/campaigns/{id}/cancel", post(cancel_campaign))
        .route("/api/campaigns/{id}/resume", post(resume_campaign))
        .with_state(state)
}

// ============================================================================
// Authorization
// ============================================================================

/// Extract the presented secret from either accepted header
fn presented_secret(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(CRON_SECRET_HEADER) {
        return value.to_str().ok();
    }

    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Constant-time comparison against the configured secret
///
/// Refuses everything when no secret is configured.
pub fn is_authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    match (expected, presented_secret(headers)) {
        (Some(expected), Some(presented)) if !expected.is_empty() => {
            constant_time_eq::constant_time_eq(expected.as_bytes(), presented.as_bytes())
        }
        _ => false,
    }
}

/// Record the request and build the response
fn respond<T: Serialize>(endpoint: &str, status: StatusCode, body: T) -> Response {
    metrics::record_trigger_request(endpoint, status.as_u16());
    (status, Json(body)).into_response()
}

fn unauthorized(endpoint: &str) -> Response {
    warn!(endpoint = endpoint, "Rejected trigger request with missing or invalid secret");
    respond(endpoint, StatusCode::UNAUTHORIZED, ErrorResponse::new("Unauthorized"))
}

/// Status code for a driver-level failure
fn error_status(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::Store { .. } | SchedulerError::Timeout { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// Open Handlers
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    }))
}

/// Prometheus text exposition
async fn metrics_text() -> Response {
    match metrics::encode_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(e.to_string())),
        )
            .into_response(),
    }
}

// ============================================================================
// Trigger Handlers
// ============================================================================

/// Run one rotation tick
async fn trigger_rotate(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    const ENDPOINT: &str = "/api/cron/rotate";

    if !is_authorized(&headers, state.cron_secret()) {
        return unauthorized(ENDPOINT);
    }

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RotateRequest::default()
    } else {
        match serde_json::from_slice::<RotateRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                return respond(
                    ENDPOINT,
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::new(format!("Malformed request body: {e}")),
                );
            }
        }
    };

    info!(limit = ?request.limit, "Rotation triggered over HTTP");

    match state.driver.tick_with_limit(Utc::now(), request.limit).await {
        Ok(report) => respond(ENDPOINT, StatusCode::OK, ApiResponse::<TickReport>::success(report)),
        Err(e) => {
            error!(error = %e, "Triggered tick failed");
            respond(ENDPOINT, error_status(&e), ErrorResponse::new(e.to_string()))
        }
    }
}

/// Run the analytics finalizer once
async fn trigger_finalize(State(state): State<AppState>, headers: HeaderMap) -> Response {
    const ENDPOINT: &str = "/api/cron/finalize";

    if !is_authorized(&headers, state.cron_secret()) {
        return unauthorized(ENDPOINT);
    }

    if !state.driver.has_finalizer() {
        return respond(
            ENDPOINT,
            StatusCode::NOT_FOUND,
            ErrorResponse::new("Analytics finalizer is not configured"),
        );
    }

    match state.driver.run_finalizer(Utc::now()).await {
        Ok(report) => respond(
            ENDPOINT,
            StatusCode::OK,
            ApiResponse::<FinalizeReport>::success(report),
        ),
        Err(e) => {
            error!(error = %e, "Triggered finalizer run failed");
            respond(ENDPOINT, error_status(&e), ErrorResponse::new(e.to_string()))
        }
    }
}

// ============================================================================
// Operator Handlers
// ============================================================================

/// Running and cancelled campaigns, finalizer cooldown
async fn get_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    const ENDPOINT: &str = "/api/status";

    if !is_authorized(&headers, state.cron_secret()) {
        return unauthorized(ENDPOINT);
    }

    respond(
        ENDPOINT,
        StatusCode::OK,
        ApiResponse::success(StatusResponse {
            driver: state.driver.status(),
            uptime_secs: state.start_time.elapsed().as_secs(),
        }),
    )
}

async fn cancel_campaign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    set_cancelled(&state, &headers, &id, true).await
}

async fn resume_campaign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    set_cancelled(&state, &headers, &id, false).await
}

async fn set_cancelled(state: &AppState, headers: &HeaderMap, id: &str, cancel: bool) -> Response {
    let endpoint = if cancel {
        "/api/campaigns/{id}/cancel"
    } else {
        "/api/campaigns/{id}/resume"
    };

    if !is_authorized(headers, state.cron_secret()) {
        return unauthorized(endpoint);
    }

    let campaign_id = match Uuid::parse_str(id) {
        Ok(id) => id,
        Err(_) => {
            return respond(
                endpoint,
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(format!("Invalid campaign ID: {}", id)),
            );
        }
    };

    match state.store.get_campaign(campaign_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return respond(
                endpoint,
                StatusCode::NOT_FOUND,
                ErrorResponse::new(format!("Campaign not found: {}", campaign_id)),
            );
        }
        Err(e) => {
            return respond(
                endpoint,
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new(e.to_string()),
            );
        }
    }

    let changed = if cancel {
        state.driver.cancel(campaign_id)
    } else {
        state.driver.resume(campaign_id)
    };

    respond(
        endpoint,
        StatusCode::OK,
        ApiResponse::success(CancellationResponse {
            campaign_id,
            cancelled: cancel,
            changed,
        }),
    )
}

// ============================================================================
// Tests
// ============================================================================
