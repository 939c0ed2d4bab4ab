//! Prometheus counters and the `/health` and `/metrics` responses.

use crate::error::ProxyError;
use crate::forwarding::{ProxyBody, full_body};
use bytes::Bytes;
use hyper::{Response, StatusCode};
use hyper::header::CONTENT_TYPE;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde_json::json;

const NAMESPACE: &str = "preview_bridge";

/// How a proxied request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Buffered,
    Streamed,
    Error,
    Rejected,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Buffered => "buffered",
            Outcome::Streamed => "streamed",
            Outcome::Error => "error",
            Outcome::Rejected => "rejected",
        }
    }
}

#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    requests: IntCounterVec,
    errors: IntCounterVec,
    rewritten_bytes: IntCounter,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, ProxyError> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Proxied requests by outcome").namespace(NAMESPACE),
            &["outcome"],
        )
        .map_err(metric_error)?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Requests converted to the error document, by cause")
                .namespace(NAMESPACE),
            &["kind"],
        )
        .map_err(metric_error)?;
        let rewritten_bytes = IntCounter::with_opts(
            Opts::new("rewritten_bytes_total", "Bytes of rewritten HTML/CSS served")
                .namespace(NAMESPACE),
        )
        .map_err(metric_error)?;

        registry.register(Box::new(requests.clone())).map_err(metric_error)?;
        registry.register(Box::new(errors.clone())).map_err(metric_error)?;
        registry.register(Box::new(rewritten_bytes.clone())).map_err(metric_error)?;
        crate::secrets::register_secret_metrics(&registry);

        Ok(Self {
            registry,
            requests,
            errors,
            rewritten_bytes,
        })
    }

    pub fn record(&self, outcome: Outcome) {
        self.requests.with_label_values(&[outcome.label()]).inc();
    }

    pub fn record_error(&self, err: &ProxyError) {
        self.record(Outcome::Error);
        self.errors.with_label_values(&[err.kind()]).inc();
    }

    pub fn record_rewritten_bytes(&self, len: usize) {
        self.rewritten_bytes.inc_by(len as u64);
    }

    pub fn requests_with_outcome(&self, outcome: Outcome) -> u64 {
        self.requests.with_label_values(&[outcome.label()]).get()
    }

    pub fn encode(&self) -> Result<String, ProxyError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| ProxyError::Unexpected(e.to_string()))
    }

    pub fn metrics_response(&self) -> Response<ProxyBody> {
        match self.encode() {
            Ok(payload) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(Bytes::from(payload)))
                .unwrap_or_else(|_| plain_response(StatusCode::OK, "")),
            Err(e) => {
                log::error!("Failed to encode Prometheus metrics: {}", e);
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        }
    }
}

fn metric_error(err: prometheus::Error) -> ProxyError {
    ProxyError::Unexpected(format!("metrics: {}", err))
}

pub fn health_response() -> Response<ProxyBody> {
    let payload = json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let mut response = Response::new(full_body(Bytes::from(payload.to_string())));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

pub fn plain_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_exported() {
        let metrics = ProxyMetrics::new().unwrap();
        metrics.record(Outcome::Streamed);
        metrics.record(Outcome::Streamed);
        metrics.record_error(&ProxyError::InvalidPort("x".into()));
        metrics.record_rewritten_bytes(42);

        assert_eq!(metrics.requests_with_outcome(Outcome::Streamed), 2);
        assert_eq!(metrics.requests_with_outcome(Outcome::Error), 1);

        let text = metrics.encode().unwrap();
        assert!(text.contains("preview_bridge_requests_total{outcome=\"streamed\"} 2"));
        assert!(text.contains("preview_bridge_errors_total{kind=\"invalid_port\"} 1"));
        assert!(text.contains("preview_bridge_rewritten_bytes_total 42"));
    }

    #[test]
    fn test_health_response() {
        let response = health_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }
}
