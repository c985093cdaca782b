//! Request instrumentation.
//!
//! Per request:
//!
//! ```text
//! entry  http_requests_in_progress{method,route}            += 1
//! exit   http_requests_total{method,route,status}           += 1
//!        http_request_duration_seconds{method,route,status} observe(secs)
//!        http_requests_in_progress{method,route}            -= 1
//! ```
//!
//! The exit half runs from a guard's `Drop`, so it also fires when the
//! handler panics or the request future is dropped; the status recorded
//! then is 500. The in-progress increment and decrement are tagged with the
//! registry's reset generation; if a reset clears the increment, the
//! decrement is skipped. Recording failures are logged and never change
//! the response.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tally_metrics::Metrics;
use tracing::warn;

use crate::{ApiState, route_name};

pub const REQUESTS_TOTAL: &str = "http_requests_total";
pub const REQUEST_DURATION: &str = "http_request_duration_seconds";
pub const REQUESTS_IN_PROGRESS: &str = "http_requests_in_progress";

/// Metrics middleware; install with `from_fn_with_state`.
pub async fn track_metrics(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let method = request.method().as_str().to_string();
    let route = route_label(&request);

    let guard = InFlight::start(Arc::clone(&state.metrics), method, route);
    let response = next.run(request).await;
    guard.finish(response.status().as_u16());
    response
}

/// Declared route name → matched path pattern → trimmed request path → `"unknown"`.
pub fn route_label(request: &Request) -> String {
    if let Some(matched) = request.extensions().get::<MatchedPath>() {
        if let Some(name) = route_name(request.method(), matched.as_str()) {
            return name.to_string();
        }
        return matched.as_str().trim_start_matches('/').to_string();
    }

    let path = request.uri().path().trim_matches('/');
    if path.is_empty() {
        "unknown".to_string()
    } else {
        path.to_string()
    }
}

/// One in-flight request. Records the exit metrics when dropped.
struct InFlight {
    metrics: Arc<Metrics>,
    method: String,
    route: String,
    started: Instant,
    status: u16,
    /// Reset generation of the in-progress increment; `None` if it failed.
    generation: Option<u64>,
}

impl InFlight {
    fn start(metrics: Arc<Metrics>, method: String, route: String) -> Self {
        let labels = [("method", method.as_str()), ("route", route.as_str())];
        let generation = match metrics.increment_gauge_tracked(REQUESTS_IN_PROGRESS, &labels, 1.0) {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!(error = %e, metric = REQUESTS_IN_PROGRESS, "request metric not recorded");
                None
            }
        };
        Self {
            metrics,
            method,
            route,
            started: Instant::now(),
            status: 500,
            generation,
        }
    }

    fn finish(mut self, status: u16) {
        self.status = status;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let status = self.status.to_string();
        let base = [("method", self.method.as_str()), ("route", self.route.as_str())];
        let labels = [base[0], base[1], ("status", status.as_str())];

        let mut results = vec![
            (REQUESTS_TOTAL, self.metrics.increment_counter(REQUESTS_TOTAL, &labels, 1.0)),
            (REQUEST_DURATION, self.metrics.observe_histogram(REQUEST_DURATION, &labels, elapsed)),
        ];
        if let Some(generation) = self.generation {
            let decremented = self
                .metrics
                .decrement_gauge_if_generation(REQUESTS_IN_PROGRESS, &base, 1.0, generation)
                .map(|_| ());
            results.push((REQUESTS_IN_PROGRESS, decremented));
        }
        for (metric, result) in results {
            if let Err(e) = result {
                warn!(error = %e, metric, "request metric not recorded");
            }
        }
    }
}
