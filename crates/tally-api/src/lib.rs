//! tally-api — HTTP surface for the tally metrics engine.
//!
//! Serves the scrape endpoint and the reset endpoint, a health check and a
//! log/trace correlation probe. Every request passes through two layers:
//! trace context (outermost) and per-request metrics.
//!
//! # API Routes
//!
//! | Method | Path | Route name | Description |
//! |---|---|---|---|
//! | GET | `/metrics` | `metrics.index` | Prometheus exposition |
//! | POST | `/metrics/reset` | `metrics.reset` | Clear every metric |
//! | GET | `/api/health` | `health` | Service identity and telemetry status |
//! | GET | `/api/test-log` | `test-log.get` | Emit a log event at `?level=` |
//! | POST | `/api/test-log` | `test-log.post` | Same, for POST |

pub mod handlers;
pub mod middleware;
pub mod trace;

use std::sync::Arc;

use axum::Router;
use axum::http::Method;
use axum::routing::{get, post};
use tally_core::config::ServiceConfig;
use tally_metrics::Metrics;

/// Shared state for handlers and the metrics middleware.
#[derive(Clone)]
pub struct ApiState {
    pub metrics: Arc<Metrics>,
    pub service: ServiceConfig,
}

impl ApiState {
    pub fn new(metrics: Arc<Metrics>, service: ServiceConfig) -> Self {
        Self { metrics, service }
    }
}

/// The declared name of a route, if it has one.
pub fn route_name(method: &Method, pattern: &str) -> Option<&'static str> {
    let name = match (method.as_str(), pattern) {
        ("GET", "/metrics") => "metrics.index",
        ("POST", "/metrics/reset") => "metrics.reset",
        ("GET", "/api/health") => "health",
        ("GET", "/api/test-log") => "test-log.get",
        ("POST", "/api/test-log") => "test-log.post",
        _ => return None,
    };
    Some(name)
}

/// Build the complete router with both middleware layers applied.
pub fn build_router(state: ApiState) -> Router {
    let routes = Router::new()
        .route("/metrics", get(handlers::metrics_index))
        .route("/metrics/reset", post(handlers::metrics_reset))
        .route("/api/health", get(handlers::health))
        .route("/api/test-log", get(handlers::test_log).post(handlers::test_log));

    instrument(routes, state)
}

/// Wrap any router in the metrics and trace-context layers.
///
/// Lets embedding applications mount their own routes and have them
/// counted the same way as the built-in ones.
pub fn instrument(routes: Router<ApiState>, state: ApiState) -> Router {
    routes
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::track_metrics,
        ))
        .layer(axum::middleware::from_fn(trace::trace_context))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_names() {
        assert_eq!(route_name(&Method::GET, "/metrics"), Some("metrics.index"));
        assert_eq!(route_name(&Method::POST, "/api/test-log"), Some("test-log.post"));
        assert_eq!(route_name(&Method::POST, "/metrics"), None);
        assert_eq!(route_name(&Method::GET, "/users/{id}"), None);
    }
}
