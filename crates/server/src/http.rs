//! Middleware wrapped around every HTTP route, the gateway upgrade included.

use std::time::Duration;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{HeaderName, UPGRADE},
        HeaderValue, Request, Response,
    },
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{field::Empty, Span};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Applied only when the handler did not set the header itself.
pub const SECURITY_HEADERS: [(&str, &str); 4] = [
    (
        "content-security-policy",
        "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'",
    ),
    ("referrer-policy", "no-referrer"),
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
];

/// Assigns each request an id (or keeps the caller's), echoes it back and
/// opens an `http.request` span that carries it.
pub fn instrument<S>(mut router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    for (name, value) in SECURITY_HEADERS {
        router = router.layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ));
    }

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
            .layer(PropagateHeaderLayer::new(request_id))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(request_span)
                    .on_response(record_response),
            ),
    )
}

fn request_span(request: &Request<Body>) -> Span {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http.request",
        method = %request.method(),
        route = %route,
        request_id = %request_id,
        upgrade = request.headers().contains_key(UPGRADE),
        status_code = Empty,
        latency_ms = Empty
    )
}

fn record_response(response: &Response<Body>, latency: Duration, span: &Span) {
    let status = response.status().as_u16();
    let latency_ms = latency.as_secs_f64() * 1000.0;
    span.record("status_code", status);
    span.record("latency_ms", latency_ms);
    tracing::debug!(parent: span, status, latency_ms, "request completed");
}
