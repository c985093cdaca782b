//! Router-level tests: middleware, endpoints, and route labels.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use tally_api::{ApiState, build_router, instrument};
use tally_api::trace::tracing_layer;
use tally_core::config::{MetricsConfig, ServiceConfig, StorageKind};
use tally_core::{LabelSet, MetricDescriptor, MetricFamily, MetricsError, MetricsResult, Mutation};
use tally_metrics::{Metrics, Registry};
use tally_store::{MemoryBackend, StorageBackend};
use tower::ServiceExt;

fn test_state() -> ApiState {
    ApiState::new(Arc::new(Metrics::in_memory()), ServiceConfig::default())
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Route this thread's spans through the OpenTelemetry layer.
fn traced() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::layer::SubscriberExt;
    tracing::subscriber::set_default(tracing_subscriber::registry().with(tracing_layer("tally-test".into())))
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_requests_are_counted_by_route_name() {
    let state = test_state();
    let router = build_router(state.clone());

    for _ in 0..3 {
        let resp = router.clone().oneshot(get_req("/api/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let output = state.metrics.render().unwrap();
    assert!(
        output.contains("http_requests_total{method=\"GET\",route=\"health\",status=\"200\"} 3\n"),
        "{output}"
    );
    assert!(output.contains("http_requests_in_progress{method=\"GET\",route=\"health\"} 0\n"));
    assert!(output.contains(
        "http_request_duration_seconds_count{method=\"GET\",route=\"health\",status=\"200\"} 3\n"
    ));
}

#[tokio::test]
async fn scrape_includes_itself_and_app_info() {
    let state = test_state();
    let router = build_router(state);

    // First scrape records its own request on exit, so the second one sees it.
    router.clone().oneshot(get_req("/metrics")).await.unwrap();
    let resp = router.oneshot(get_req("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/plain; version=0.0.4; charset=utf-8"
    );

    let body = body_string(resp).await;
    assert!(body.contains("# HELP app_info Application information\n"));
    assert!(body.contains(
        "http_requests_total{method=\"GET\",route=\"metrics.index\",status=\"200\"} 1\n"
    ));
    // The in-flight scrape is visible while it renders.
    assert!(body.contains("http_requests_in_progress{method=\"GET\",route=\"metrics.index\"} 1\n"));
}

#[tokio::test]
async fn reset_endpoint_clears_everything() {
    let state = test_state();
    let router = build_router(state.clone());
    router.clone().oneshot(get_req("/api/health")).await.unwrap();

    let req = Request::builder()
        .method("POST")
        .uri("/metrics/reset")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(body["success"], true);

    // Only the reset request itself, recorded after the clear.
    let output = state.metrics.render().unwrap();
    assert!(!output.contains("route=\"health\""));
    assert!(!output.contains("http_requests_in_progress{method=\"POST\",route=\"metrics.reset\"}"));
    assert!(output.contains(
        "http_requests_total{method=\"POST\",route=\"metrics.reset\",status=\"200\"} 1\n"
    ));
}

/// Memory backend whose `clear` is rejected by the store.
struct StubbornBackend(MemoryBackend);

impl StorageBackend for StubbornBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Redis
    }
    fn get_or_create_descriptor(&self, d: &MetricDescriptor) -> MetricsResult<MetricDescriptor> {
        self.0.get_or_create_descriptor(d)
    }
    fn write_sample(&self, d: &MetricDescriptor, l: &LabelSet, m: Mutation) -> MetricsResult<()> {
        self.0.write_sample(d, l, m)
    }
    fn read_all(&self) -> MetricsResult<Vec<MetricFamily>> {
        self.0.read_all()
    }
    fn clear(&self) -> MetricsResult<()> {
        Err(MetricsError::Serialization("redis: NOPERM".into()))
    }
}

#[tokio::test]
async fn reset_failure_is_a_structured_500() {
    let registry = Arc::new(Registry::new(Arc::new(StubbornBackend(MemoryBackend::new()))));
    let metrics = Arc::new(Metrics::new(registry, MetricsConfig::default()));
    let router = build_router(ApiState::new(metrics, ServiceConfig::default()));

    let req = Request::builder()
        .method("POST")
        .uri("/metrics/reset")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("NOPERM"));
}

#[tokio::test]
async fn unmatched_requests_use_trimmed_path() {
    let state = test_state();
    let router = build_router(state.clone());

    let resp = router.oneshot(get_req("/no/such/page/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let output = state.metrics.render().unwrap();
    assert!(output.contains(
        "http_requests_total{method=\"GET\",route=\"no/such/page\",status=\"404\"} 1\n"
    ));
}

#[tokio::test]
async fn unnamed_routes_use_path_pattern_without_leading_slash() {
    let state = test_state();
    let routes: Router<ApiState> = Router::new().route("/users/{id}", get(|| async { "ok" }));
    let router = instrument(routes, state.clone());

    router.clone().oneshot(get_req("/users/1")).await.unwrap();
    router.oneshot(get_req("/users/2")).await.unwrap();

    let output = state.metrics.render().unwrap();
    assert!(output.contains(
        "http_requests_total{method=\"GET\",route=\"users/{id}\",status=\"200\"} 2\n"
    ));
}

async fn explode() -> &'static str {
    panic!("handler failure")
}

#[tokio::test]
async fn panicking_handler_is_recorded_as_500() {
    let state = test_state();
    let routes: Router<ApiState> = Router::new().route("/explode", get(explode));
    let router = instrument(routes, state.clone());

    let outcome = tokio::spawn(async move { router.oneshot(get_req("/explode")).await }).await;
    assert!(outcome.is_err());

    let output = state.metrics.render().unwrap();
    assert!(output.contains(
        "http_requests_total{method=\"GET\",route=\"explode\",status=\"500\"} 1\n"
    ));
    assert!(output.contains("http_requests_in_progress{method=\"GET\",route=\"explode\"} 0\n"));
}

#[tokio::test]
async fn traceparent_is_continued_and_echoed() {
    let _tracing = traced();
    let router = build_router(test_state());
    let req = Request::builder()
        .uri("/api/test-log?level=warning&message=hello")
        .header("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        .body(Body::empty())
        .unwrap();

    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let echoed = resp.headers().get("traceparent").unwrap().to_str().unwrap().to_string();
    assert!(echoed.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));

    let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(body["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");
    assert_eq!(body["log_level"], "warning");
    assert_eq!(body["log_message"], "hello");
    assert!(echoed.contains(body["span_id"].as_str().unwrap()));
}

#[tokio::test]
async fn test_log_accepts_post() {
    let _tracing = traced();
    let state = test_state();
    let router = build_router(state.clone());
    let req = Request::builder()
        .method("POST")
        .uri("/api/test-log?level=debug")
        .body(Body::empty())
        .unwrap();

    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("traceparent"));

    let output = state.metrics.render().unwrap();
    assert!(output.contains("route=\"test-log.post\""));
}
