//! HTTP handlers.
//!
//! The scrape and reset endpoints go through the `Metrics` facade; the
//! health and log-probe endpoints return JSON.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::ApiState;
use crate::trace::TraceContext;

/// Response wrapper for the reset endpoint and failures.
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse {
            success: false,
            message: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Metrics ────────────────────────────────────────────────────

/// GET /metrics
pub async fn metrics_index(State(state): State<ApiState>) -> impl IntoResponse {
    let service = &state.service;
    if let Err(e) = state.metrics.set_gauge(
        "app_info",
        &[
            ("version", service.version.as_str()),
            ("environment", service.environment.as_str()),
            ("service", service.name.as_str()),
        ],
        1.0,
    ) {
        warn!(error = %e, "failed to record app_info");
    }

    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", tally_metrics::CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics render failed");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

/// POST /metrics/reset
pub async fn metrics_reset(State(state): State<ApiState>) -> impl IntoResponse {
    match state.metrics.reset() {
        Ok(()) => Json(ApiResponse {
            success: true,
            message: Some("Metrics cleared successfully".to_string()),
            error: None,
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "metrics reset failed");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /api/health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let registry = state.metrics.registry();
    debug!("health check performed");
    Json(json!({
        "status": "healthy",
        "service": state.service.name,
        "version": state.service.version,
        "environment": state.service.environment,
        "timestamp": now_rfc3339(),
        "telemetry": {
            "tracing": true,
            "metrics": true,
            "storage": registry.backend_kind().as_str(),
            "storage_degraded": registry.is_degraded(),
        },
    }))
}

// ── Log probe ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TestLogParams {
    pub level: Option<String>,
    pub message: Option<String>,
}

/// GET|POST /api/test-log
///
/// Emits one event at the requested level (`debug`, `info`, `warning`,
/// `error`; anything else logs at info) inside the request span.
pub async fn test_log(
    trace: Option<axum::Extension<TraceContext>>,
    Query(params): Query<TestLogParams>,
) -> impl IntoResponse {
    let level = params.level.unwrap_or_else(|| "info".to_string());
    let message = params.message.unwrap_or_else(|| "Test log message".to_string());
    let (trace_id, span_id) = trace
        .map(|axum::Extension(ctx)| (ctx.trace_id, ctx.span_id))
        .unwrap_or_default();

    match level.as_str() {
        "debug" => debug!(%trace_id, %span_id, "{message}"),
        "warning" | "warn" => warn!(%trace_id, %span_id, "{message}"),
        "error" => error!(%trace_id, %span_id, error_code = "TEST_ERROR", "{message}"),
        _ => info!(%trace_id, %span_id, "{message}"),
    }

    Json(json!({
        "success": true,
        "message": "Log generated successfully",
        "log_level": level,
        "log_message": message,
        "trace_id": trace_id,
        "span_id": span_id,
        "timestamp": now_rfc3339(),
    }))
}
