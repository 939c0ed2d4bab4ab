//! The forwarding engine: one inbound request in, one upstream round-trip,
//! one response out.
//!
//! HTML and CSS responses are buffered so root-relative asset URLs can be
//! rewritten under the proxy prefix. Everything else is streamed back without
//! being read.

use crate::config::{Config, UpstreamConfig};
use crate::error::ProxyError;
use crate::identity::{RouteTemplate, SandboxIdentity};
use crate::logging::redact_token;
use crate::monitoring::{Outcome, ProxyMetrics};
use crate::resolver::{PreviewLink, PreviewResolver, normalize_preview_url};
use crate::rewrite::{ContentClass, RewriteRules, decode_body};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::{Body, Incoming};
use hyper::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH,
    CONTENT_TYPE, HOST, HeaderMap, HeaderName, HeaderValue, ORIGIN, TRANSFER_ENCODING,
};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;
pub type HttpClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// Body served for every failed proxy request.
pub const ERROR_DOCUMENT: &str = "<!DOCTYPE html><html><head><title>Proxy Error</title></head><body><h1>Preview Error</h1><p>Failed to load sandbox. Check console.</p></body></html>";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Headers that would stop the preview from rendering inside the host app.
const EMBEDDING_BLOCKERS: [&str; 3] = [
    "x-frame-options",
    "content-security-policy",
    "referrer-policy",
];

const ERROR_SNIPPET_CHARS: usize = 200;
// Enough bytes for ERROR_SNIPPET_CHARS of UTF-8.
const ERROR_BODY_READ_BYTES: usize = ERROR_SNIPPET_CHARS * 4;
const PREVIEW_CHARS: usize = 500;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Shared HTTPS-capable client used for both preview lookups and forwarding.
pub fn build_http_client(config: &UpstreamConfig) -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
        .build(HttpsConnector::new())
}

pub fn error_response() -> Response<ProxyBody> {
    let mut response = Response::new(full_body(ERROR_DOCUMENT));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

/// Join the preview base URL and the request subpath.
///
/// Runs of `/` after the scheme separator are collapsed so a trailing slash on
/// the base and an empty subpath segment never produce `//` in the path.
pub fn build_target_url(base: &str, subpath: &str, query: Option<&str>) -> String {
    let joined = format!("{}/{}", base.trim_end_matches('/'), subpath);
    let (scheme, rest) = match joined.find("://") {
        Some(idx) => joined.split_at(idx + 3),
        None => ("", joined.as_str()),
    };

    let mut url = String::with_capacity(joined.len() + query.map_or(0, |q| q.len() + 1));
    url.push_str(scheme);
    let mut previous_slash = false;
    for c in rest.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        url.push(c);
    }

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Remove hop-by-hop headers, including any named in `connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Drop embedding blockers and force permissive CORS and no caching.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    for name in EMBEDDING_BLOCKERS {
        headers.remove(name);
    }
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
}

/// Per-engine settings derived from the validated configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub route: RouteTemplate,
    pub token_header: HeaderName,
    pub skip_warning_header: HeaderName,
    pub timeout: Duration,
    pub upstream: UpstreamConfig,
    pub debug_body_preview: bool,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let header = |field: &str, value: &str| {
            HeaderName::from_bytes(value.as_bytes())
                .map_err(|_| ProxyError::Config(format!("{} is not a valid header name: '{}'", field, value)))
        };
        Ok(Self {
            route: config.route_template(),
            token_header: header("preview_api.token_header", &config.preview_api.token_header)?,
            skip_warning_header: header(
                "preview_api.skip_warning_header",
                &config.preview_api.skip_warning_header,
            )?,
            timeout: Duration::from_secs(config.upstream.timeout_secs),
            upstream: config.upstream.clone(),
            debug_body_preview: config.debug_body_preview,
        })
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            route: RouteTemplate::default(),
            token_header: HeaderName::from_static("x-daytona-preview-token"),
            skip_warning_header: HeaderName::from_static("x-daytona-skip-preview-warning"),
            timeout: Duration::from_secs(60),
            upstream: UpstreamConfig::default(),
            debug_body_preview: false,
        }
    }
}

pub struct ForwardingEngine {
    settings: EngineSettings,
    resolver: Arc<dyn PreviewResolver>,
    rules: RewriteRules,
    client: HttpClient,
    metrics: Option<ProxyMetrics>,
}

impl ForwardingEngine {
    pub fn new(settings: EngineSettings, resolver: Arc<dyn PreviewResolver>, rules: RewriteRules) -> Self {
        let client = build_http_client(&settings.upstream);
        Self {
            settings,
            resolver,
            rules,
            client,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ProxyMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Proxy one request. Every failure becomes the 500 error document.
    pub async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.process(req).await {
            Ok((response, outcome)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record(outcome);
                }
                debug!(
                    "{} {} -> {} ({:?}) in {:?}",
                    method,
                    path,
                    response.status(),
                    outcome,
                    started.elapsed()
                );
                response
            }
            Err(e) => {
                error!("Preview proxy error for {} {}: {}", method, path, e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(&e);
                }
                error_response()
            }
        }
    }

    async fn process(&self, req: Request<ProxyBody>) -> Result<(Response<ProxyBody>, Outcome), ProxyError> {
        let (identity, subpath) = self.settings.route.resolve(req.uri().path())?;
        let link = self.resolve_link(&identity).await?;
        let base = normalize_preview_url(&link.url)?;
        let target = build_target_url(&base, &subpath, req.uri().query());
        info!(
            "Proxying {} {} -> {} (token {})",
            req.method(),
            req.uri().path(),
            target,
            redact_token(&link.token)
        );

        let method = req.method().clone();
        let upstream_req = self.build_upstream_request(req, &target, &link.token)?;
        let response = self.send(upstream_req, &target).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.upstream_status_error(response, &target).await);
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        sanitize_response_headers(&mut parts.headers);

        let class = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ContentClass::classify)
            .unwrap_or(ContentClass::Passthrough);

        if class.is_bufferable() && method != Method::HEAD {
            let proxy_prefix = self.settings.route.proxy_prefix(&identity);
            let response = self.rewrite_buffered(parts, body, class, &proxy_prefix, &target).await?;
            Ok((response, Outcome::Buffered))
        } else {
            debug!("Streaming {} response from {}", class.as_str(), target);
            Ok((Response::from_parts(parts, body.boxed()), Outcome::Streamed))
        }
    }

    async fn resolve_link(&self, identity: &SandboxIdentity) -> Result<PreviewLink, ProxyError> {
        timeout(
            self.settings.timeout,
            self.resolver.resolve(&identity.sandbox_id, identity.port),
        )
        .await
        .map_err(|_| {
            ProxyError::UpstreamResolution(format!(
                "preview lookup for sandbox {} port {} timed out after {:?}",
                identity.sandbox_id, identity.port, self.settings.timeout
            ))
        })?
    }

    /// Rebuild the inbound request for the sandbox origin. The body is moved
    /// across untouched, so uploads stream through without buffering.
    pub fn build_upstream_request(
        &self,
        req: Request<ProxyBody>,
        target: &str,
        token: &str,
    ) -> Result<Request<ProxyBody>, ProxyError> {
        let uri: Uri = target
            .parse()
            .map_err(|e| ProxyError::UpstreamRequest(format!("invalid target URL {}: {}", target, e)))?;

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.remove(ORIGIN);

        let mut token_value = HeaderValue::from_str(token).map_err(|_| {
            ProxyError::UpstreamResolution("preview token contains invalid header characters".to_string())
        })?;
        token_value.set_sensitive(true);
        headers.insert(self.settings.token_header.clone(), token_value);
        headers.insert(
            self.settings.skip_warning_header.clone(),
            HeaderValue::from_static("true"),
        );

        let mut upstream = Request::new(body);
        *upstream.method_mut() = parts.method;
        *upstream.uri_mut() = uri;
        *upstream.headers_mut() = headers;
        Ok(upstream)
    }

    async fn send(&self, req: Request<ProxyBody>, target: &str) -> Result<Response<Incoming>, ProxyError> {
        timeout(self.settings.timeout, self.client.request(req))
            .await
            .map_err(|_| {
                ProxyError::UpstreamRequest(format!(
                    "{} did not respond within {:?}",
                    target, self.settings.timeout
                ))
            })?
            .map_err(|e| ProxyError::UpstreamRequest(format!("{}: {}", target, e)))
    }

    async fn upstream_status_error(&self, response: Response<Incoming>, target: &str) -> ProxyError {
        let status = response.status();
        let snippet = read_error_snippet(response.into_body(), self.settings.timeout).await;
        error!("Upstream {} returned {}: {}", target, status, snippet);
        ProxyError::UpstreamRequest(format!("{} returned {}", target, status))
    }

    async fn rewrite_buffered(
        &self,
        mut parts: http::response::Parts,
        body: Incoming,
        class: ContentClass,
        proxy_prefix: &str,
        target: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let raw = body
            .collect()
            .await
            .map_err(|e| ProxyError::UpstreamRequest(format!("failed to read body from {}: {}", target, e)))?
            .to_bytes();

        let encoding = parts
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let decoded = match decode_body(&raw, encoding.as_deref()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    "Serving {} from {} without rewriting: {}",
                    class.as_str(),
                    target,
                    e
                );
                parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(raw.len()));
                return Ok(Response::from_parts(parts, full_body(raw)));
            }
        };

        let text = String::from_utf8_lossy(&decoded);
        if self.settings.debug_body_preview {
            log_body_preview(class, target, &text);
        }

        let rewritten = self.rules.apply(class, &text, proxy_prefix);
        if let Some(metrics) = &self.metrics {
            metrics.record_rewritten_bytes(rewritten.len());
        }

        parts.headers.remove(CONTENT_ENCODING);
        parts.headers.remove(TRANSFER_ENCODING);
        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
        Ok(Response::from_parts(parts, full_body(rewritten)))
    }
}

fn log_body_preview(class: ContentClass, target: &str, text: &str) {
    let preview: String = text.chars().take(PREVIEW_CHARS).collect();
    info!(
        "{} body from {} ({} bytes): {}",
        class.as_str(),
        target,
        text.len(),
        preview
    );
    if text.trim().is_empty() {
        warn!("Upstream {} returned an empty {} body", target, class.as_str());
    } else if text.contains("Preview Warning") || text.to_ascii_lowercase().contains("daytona") {
        warn!("Upstream {} looks like a Daytona preview warning page", target);
    } else if text.contains("__next") {
        debug!("Upstream {} served Next.js markup", target);
    }
}

/// Read at most the first few hundred bytes of an error body, giving up after
/// `wait`. The rest of the body is never read.
async fn read_error_snippet<B>(body: B, wait: Duration) -> String
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let read = async move {
        let mut body = std::pin::pin!(body);
        let mut buf = Vec::new();
        while buf.len() < ERROR_BODY_READ_BYTES {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        buf.extend_from_slice(&data);
                    }
                }
                Some(Err(e)) => return Err(e.to_string()),
                None => break,
            }
        }
        Ok(buf)
    };

    match timeout(wait, read).await {
        Ok(Ok(buf)) => String::from_utf8_lossy(&buf)
            .chars()
            .take(ERROR_SNIPPET_CHARS)
            .collect(),
        Ok(Err(e)) => format!("<unreadable body: {}>", e),
        Err(_) => format!("<no body within {:?}>", wait),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedResolver;

    #[async_trait]
    impl PreviewResolver for FixedResolver {
        async fn resolve(&self, _sandbox_id: &str, _port: i64) -> Result<PreviewLink, ProxyError> {
            Ok(PreviewLink {
                url: "https://3000-sb1.proxy.example".to_string(),
                token: "tok".to_string(),
            })
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl PreviewResolver for FailingResolver {
        async fn resolve(&self, sandbox_id: &str, _port: i64) -> Result<PreviewLink, ProxyError> {
            Err(ProxyError::UpstreamResolution(format!("unknown sandbox {}", sandbox_id)))
        }
    }

    fn engine(resolver: Arc<dyn PreviewResolver>) -> ForwardingEngine {
        ForwardingEngine::new(EngineSettings::default(), resolver, RewriteRules::default())
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_build_target_url() {
        assert_eq!(build_target_url("https://h/", "a/b", None), "https://h/a/b");
        assert_eq!(build_target_url("https://h", "", None), "https://h/");
        assert_eq!(build_target_url("https://h//", "/a//b", None), "https://h/a/b");
        assert_eq!(build_target_url("http://h:3000/base", "x", None), "http://h:3000/base/x");
    }

    #[test]
    fn test_build_target_url_keeps_query() {
        assert_eq!(
            build_target_url("https://h", "page", Some("a=1&b=//x")),
            "https://h/page?a=1&b=//x"
        );
        assert_eq!(build_target_url("https://h", "page", Some("")), "https://h/page");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-custom-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-custom-hop", HeaderValue::from_static("1"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_sanitize_response_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        headers.insert("content-security-policy", HeaderValue::from_static("frame-ancestors 'none'"));
        headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=3600"));
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("https://a"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        sanitize_response_headers(&mut headers);
        assert!(!headers.contains_key("x-frame-options"));
        assert!(!headers.contains_key("content-security-policy"));
        assert!(!headers.contains_key("referrer-policy"));
        assert_eq!(headers[CACHE_CONTROL], "no-cache");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[CONTENT_ENCODING], "gzip");
    }

    #[tokio::test]
    async fn test_upstream_request_headers() {
        let engine = engine(Arc::new(FixedResolver));
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/proxy/preview/sb1/3000/submit")
            .header(HOST, "app.local")
            .header(ORIGIN, "https://app.local")
            .header(CONTENT_LENGTH, "5")
            .header(CONNECTION, "keep-alive")
            .header("x-app", "1")
            .body(full_body("hello"))
            .unwrap();

        let upstream = engine
            .build_upstream_request(req, "https://3000-sb1.proxy.example/submit", "tok-123")
            .unwrap();
        assert_eq!(upstream.method(), &Method::POST);
        assert_eq!(upstream.uri(), "https://3000-sb1.proxy.example/submit");
        let headers = upstream.headers();
        assert!(!headers.contains_key(HOST));
        assert!(!headers.contains_key(ORIGIN));
        assert!(!headers.contains_key(CONNECTION));
        assert_eq!(headers[CONTENT_LENGTH], "5");
        assert_eq!(headers["x-app"], "1");
        assert_eq!(headers["x-daytona-preview-token"], "tok-123");
        assert_eq!(headers["x-daytona-skip-preview-warning"], "true");
    }

    #[tokio::test]
    async fn test_malformed_path_returns_error_document() {
        let engine = engine(Arc::new(FixedResolver));
        let req = Request::builder()
            .uri("/api/proxy/preview/sb1")
            .body(empty_body())
            .unwrap();

        let response = engine.handle(req).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html; charset=utf-8");
        assert_eq!(body_text(response).await, ERROR_DOCUMENT);
    }

    #[tokio::test]
    async fn test_resolution_failure_returns_error_document() {
        let metrics = ProxyMetrics::new().unwrap();
        let engine = engine(Arc::new(FailingResolver)).with_metrics(metrics.clone());
        let req = Request::builder()
            .uri("/api/proxy/preview/missing/3000/")
            .body(empty_body())
            .unwrap();

        let response = engine.handle(req).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, ERROR_DOCUMENT);
        assert_eq!(metrics.requests_with_outcome(Outcome::Error), 1);
    }

    #[test]
    fn test_settings_reject_bad_header_names() {
        let mut config = Config::default();
        config.preview_api.token_header = "bad header".to_string();
        assert!(matches!(
            EngineSettings::from_config(&config),
            Err(ProxyError::Config(_))
        ));
    }

    /// Yields 64-byte chunks forever, or never yields at all.
    struct EndlessBody {
        stalled: bool,
    }

    impl Body for EndlessBody {
        type Data = Bytes;
        type Error = std::convert::Infallible;

        fn poll_frame(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Result<hyper::body::Frame<Bytes>, Self::Error>>> {
            if self.stalled {
                std::task::Poll::Pending
            } else {
                std::task::Poll::Ready(Some(Ok(hyper::body::Frame::data(Bytes::from_static(
                    &[b'x'; 64],
                )))))
            }
        }
    }

    #[tokio::test]
    async fn test_error_snippet_stops_reading_endless_body() {
        let snippet = read_error_snippet(EndlessBody { stalled: false }, Duration::from_secs(5)).await;
        assert_eq!(snippet, "x".repeat(ERROR_SNIPPET_CHARS));
    }

    #[tokio::test]
    async fn test_error_snippet_gives_up_on_stalled_body() {
        let snippet = read_error_snippet(EndlessBody { stalled: true }, Duration::from_millis(50)).await;
        assert!(snippet.starts_with("<no body within"));
    }

    #[tokio::test]
    async fn test_error_snippet_short_body() {
        let snippet = read_error_snippet(Full::new(Bytes::from_static(b"boom")), Duration::from_secs(1)).await;
        assert_eq!(snippet, "boom");
    }
}
