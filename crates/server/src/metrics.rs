#![cfg(feature = "metrics")]

use anyhow::Result;
use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub gateway_connections: IntGauge,
    pub gateway_events_total: IntCounterVec,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "huddle_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let gateway_connections = IntGauge::new(
            "huddle_gateway_connections",
            "Authenticated gateway connections currently open",
        )?;
        registry.register(Box::new(gateway_connections.clone()))?;

        let gateway_events_total = IntCounterVec::new(
            Opts::new(
                "huddle_gateway_events_total",
                "Client events handled by the gateway, labeled by event and outcome",
            ),
            &["event", "outcome"],
        )?;
        registry.register(Box::new(gateway_events_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            gateway_connections,
            gateway_events_total,
        }))
    }

    pub fn record_event(&self, event: &str, outcome: &str) {
        self.gateway_events_total
            .with_label_values(&[event, outcome])
            .inc();
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Counts every HTTP response by matched route and status.
pub async fn count_responses(
    State(metrics): State<Arc<MetricsContext>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_owned(), |matched| matched.as_str().to_owned());
    let response = next.run(request).await;
    metrics
        .http_requests_total
        .with_label_values(&[route.as_str(), response.status().as_str()])
        .inc();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http, middleware, routing::get, Router};
    use tower::ServiceExt;

    #[test]
    fn encodes_registered_families() {
        let metrics = MetricsContext::init().expect("metrics");
        metrics
            .http_requests_total
            .with_label_values(&["health", "200"])
            .inc();
        metrics.gateway_connections.set(3);
        metrics.record_event("send_message", "ok");

        let body = String::from_utf8(metrics.encode().expect("encode")).expect("utf8");
        assert!(body.contains("huddle_http_requests_total{route=\"health\",status=\"200\"} 1"));
        assert!(body.contains("huddle_gateway_connections 3"));
        assert!(body.contains("huddle_gateway_events_total{event=\"send_message\",outcome=\"ok\"} 1"));
    }

    #[tokio::test]
    async fn responses_are_counted_per_matched_route() {
        let metrics = MetricsContext::init().expect("metrics");
        let app = Router::new()
            .route("/rooms/{id}", get(|| async { "room" }))
            .layer(middleware::from_fn_with_state(metrics.clone(), count_responses));

        for id in ["general", "design"] {
            let response = app
                .clone()
                .oneshot(
                    http::Request::builder()
                        .uri(format!("/rooms/{id}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), http::StatusCode::OK);
        }

        let body = String::from_utf8(metrics.encode().expect("encode")).expect("utf8");
        assert!(body.contains("huddle_http_requests_total{route=\"/rooms/{id}\",status=\"200\"} 2"));
    }
}
