//! W3C trace context propagation over OpenTelemetry.
//!
//! The incoming `traceparent` is extracted with the W3C
//! [`TraceContextPropagator`] and set as the parent of an `http.request`
//! span; the server span's context is injected back into the response.
//! Span ids come from the OpenTelemetry layer returned by [`tracing_layer`].
//! Without that layer installed, requests pass through untraced.
//!
//! No exporter is configured; ids are only used for log correlation.

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{TraceContextExt, TracerProvider as _};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::{Instrument, Subscriber, field, info_span};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::Layer;
use tracing_subscriber::registry::LookupSpan;

pub const TRACEPARENT: &str = "traceparent";

/// Trace identity of the request being served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    /// Span id of this server span.
    pub span_id: String,
    /// Span id received from the caller, if any.
    pub parent_span_id: Option<String>,
    pub sampled: bool,
}

impl TraceContext {
    /// Ids of the active span in `cx`, if it carries a valid span context.
    pub fn from_context(cx: &Context) -> Option<Self> {
        let span = cx.span();
        let sc = span.span_context();
        sc.is_valid().then(|| Self {
            trace_id: sc.trace_id().to_string(),
            span_id: sc.span_id().to_string(),
            parent_span_id: None,
            sampled: sc.is_sampled(),
        })
    }
}

/// `tracing` layer that gives spans OpenTelemetry trace and span ids.
///
/// Backed by an SDK tracer provider with no exporter.
pub fn tracing_layer<S>(service: String) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let provider = SdkTracerProvider::builder().build();
    let tracer = provider.tracer(service);
    tracing_opentelemetry::layer().with_tracer(tracer)
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            self.0.insert(name, value);
        }
    }
}

/// Trace-context middleware.
pub async fn trace_context(mut request: Request, next: Next) -> Response {
    let propagator = TraceContextPropagator::new();
    let parent = propagator.extract(&HeaderExtractor(request.headers()));

    let span = info_span!(
        "http.request",
        trace_id = field::Empty,
        span_id = field::Empty,
        parent_span_id = field::Empty,
        method = %request.method(),
        path = %request.uri().path(),
        status = field::Empty,
    );
    span.set_parent(parent.clone());
    let cx = span.context();

    if let Some(mut ctx) = TraceContext::from_context(&cx) {
        ctx.parent_span_id = TraceContext::from_context(&parent).map(|p| p.span_id);
        span.record("trace_id", ctx.trace_id.as_str());
        span.record("span_id", ctx.span_id.as_str());
        if let Some(parent_id) = &ctx.parent_span_id {
            span.record("parent_span_id", parent_id.as_str());
        }
        request.extensions_mut().insert(ctx);
    }

    let mut response = next.run(request).instrument(span.clone()).await;
    span.record("status", response.status().as_u16());

    propagator.inject_context(&cx, &mut HeaderInjector(response.headers_mut()));
    response
}
