//! Preview-URL lookup: maps `(sandboxId, port)` to the origin that actually
//! serves that port, plus the access token the origin expects.

use crate::error::ProxyError;
use crate::forwarding::{HttpClient, empty_body};
use crate::logging::redact_token;
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use hyper::{Method, Request};
use log::debug;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;
use zeroize::Zeroizing;

/// Characters escaped when a sandbox id is placed in a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Origin and credential for one sandbox port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewLink {
    pub url: String,
    pub token: String,
}

#[async_trait]
pub trait PreviewResolver: Send + Sync {
    async fn resolve(&self, sandbox_id: &str, port: i64) -> Result<PreviewLink, ProxyError>;
}

#[derive(Deserialize)]
struct PreviewLinkPayload {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Resolver backed by the Daytona sandbox REST API.
pub struct DaytonaPreviewResolver {
    client: HttpClient,
    api_url: String,
    api_key: Zeroizing<String>,
}

impl DaytonaPreviewResolver {
    pub fn new(client: HttpClient, api_url: &str, api_key: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: Zeroizing::new(api_key.to_string()),
        }
    }

    pub fn lookup_url(&self, sandbox_id: &str, port: i64) -> String {
        format!(
            "{}/sandbox/{}/ports/{}/preview-url",
            self.api_url,
            utf8_percent_encode(sandbox_id, PATH_SEGMENT),
            port
        )
    }
}

#[async_trait]
impl PreviewResolver for DaytonaPreviewResolver {
    async fn resolve(&self, sandbox_id: &str, port: i64) -> Result<PreviewLink, ProxyError> {
        let lookup_url = self.lookup_url(sandbox_id, port);
        debug!("Looking up preview URL: {}", lookup_url);

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key.as_str()))
            .map_err(|_| ProxyError::Config("API key contains invalid header characters".to_string()))?;
        auth.set_sensitive(true);

        let request = Request::builder()
            .method(Method::GET)
            .uri(&lookup_url)
            .header(AUTHORIZATION, auth)
            .header(ACCEPT, "application/json")
            .body(empty_body())
            .map_err(|e| ProxyError::UpstreamResolution(format!("invalid lookup request: {}", e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ProxyError::UpstreamResolution(format!("lookup request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::UpstreamResolution(format!("lookup body read failed: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            let snippet: String = String::from_utf8_lossy(&body).chars().take(200).collect();
            return Err(ProxyError::UpstreamResolution(format!(
                "lookup for sandbox {} port {} returned {}: {}",
                sandbox_id, port, status, snippet
            )));
        }

        let payload: PreviewLinkPayload = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::UpstreamResolution(format!("invalid lookup response: {}", e)))?;

        let url = payload
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                ProxyError::UpstreamResolution(format!(
                    "lookup for sandbox {} port {} returned no URL",
                    sandbox_id, port
                ))
            })?;
        let token = payload.token.unwrap_or_default();

        debug!(
            "Resolved sandbox {} port {} -> {} (token {})",
            sandbox_id,
            port,
            url,
            redact_token(&token)
        );
        Ok(PreviewLink { url, token })
    }
}

/// Repair `https:/host` to `https://host` and default to `https://` when the
/// URL has no scheme.
pub fn normalize_preview_url(raw: &str) -> Result<String, ProxyError> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(ProxyError::UpstreamResolution("empty preview URL".to_string()));
    }

    for scheme in ["https", "http"] {
        if let Some(rest) = url.strip_prefix(scheme).and_then(|r| r.strip_prefix(":/")) {
            if !rest.starts_with('/') && !rest.is_empty() {
                return Ok(format!("{}://{}", scheme, rest));
            }
        }
    }

    if has_scheme(url) {
        Ok(url.to_string())
    } else {
        Ok(format!("https://{}", url))
    }
}

fn has_scheme(url: &str) -> bool {
    match url.find("://") {
        Some(idx) if idx > 0 => {
            let scheme = &url[..idx];
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::build_http_client;
    use crate::config::UpstreamConfig;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    async fn lookup_api(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let authorized = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok())
            == Some("Bearer test-key");
        let (status, body) = if !authorized {
            (StatusCode::UNAUTHORIZED, r#"{"message":"bad key"}"#)
        } else {
            match req.uri().path() {
                "/api/sandbox/sb1/ports/3000/preview-url" => (
                    StatusCode::OK,
                    r#"{"sandboxId":"sb1","url":"https://3000-sb1.proxy.example","token":"tok-1"}"#,
                ),
                "/api/sandbox/notoken/ports/3000/preview-url" => {
                    (StatusCode::OK, r#"{"url":"https://3000-notoken.proxy.example"}"#)
                }
                "/api/sandbox/empty/ports/3000/preview-url" => (StatusCode::OK, r#"{"url":"  "}"#),
                "/api/sandbox/garbage/ports/3000/preview-url" => (StatusCode::OK, "<html>not json</html>"),
                _ => (StatusCode::NOT_FOUND, r#"{"message":"sandbox not found"}"#),
            }
        };
        Ok(Response::builder()
            .status(status)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap())
    }

    async fn spawn_lookup_api() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(lookup_api))
                        .await;
                });
            }
        });
        format!("http://{}/api", addr)
    }

    async fn resolver_with_key(api_key: &str) -> DaytonaPreviewResolver {
        let api_url = spawn_lookup_api().await;
        let client = build_http_client(&UpstreamConfig::default());
        DaytonaPreviewResolver::new(client, &api_url, api_key)
    }

    #[tokio::test]
    async fn test_resolve_returns_url_and_token() {
        let resolver = resolver_with_key("test-key").await;
        let link = resolver.resolve("sb1", 3000).await.unwrap();
        assert_eq!(link.url, "https://3000-sb1.proxy.example");
        assert_eq!(link.token, "tok-1");

        let link = resolver.resolve("notoken", 3000).await.unwrap();
        assert_eq!(link.url, "https://3000-notoken.proxy.example");
        assert_eq!(link.token, "");
    }

    #[tokio::test]
    async fn test_resolve_rejects_unusable_lookups() {
        let resolver = resolver_with_key("test-key").await;
        for sandbox_id in ["missing", "empty", "garbage"] {
            assert!(
                matches!(
                    resolver.resolve(sandbox_id, 3000).await,
                    Err(ProxyError::UpstreamResolution(_))
                ),
                "sandbox {} should not resolve",
                sandbox_id
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_reports_status_for_bad_key() {
        let resolver = resolver_with_key("wrong-key").await;
        match resolver.resolve("sb1", 3000).await {
            Err(ProxyError::UpstreamResolution(message)) => {
                assert!(message.contains("401"), "{}", message);
                assert!(message.contains("bad key"), "{}", message);
            }
            other => panic!("unexpected result: {:?}", other.map(|link| link.url)),
        }
    }

    #[tokio::test]
    async fn test_resolve_unreachable_api() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = build_http_client(&UpstreamConfig::default());
        let resolver = DaytonaPreviewResolver::new(client, &format!("http://{}/api", addr), "test-key");
        assert!(matches!(
            resolver.resolve("sb1", 3000).await,
            Err(ProxyError::UpstreamResolution(_))
        ));
    }

    #[test]
    fn test_normalize_repairs_single_slash() {
        assert_eq!(normalize_preview_url("https:/host/path").unwrap(), "https://host/path");
        assert_eq!(normalize_preview_url("http:/host").unwrap(), "http://host");
    }

    #[test]
    fn test_normalize_adds_scheme() {
        assert_eq!(normalize_preview_url("host/path").unwrap(), "https://host/path");
        assert_eq!(
            normalize_preview_url("3000-sb1.proxy.daytona.work").unwrap(),
            "https://3000-sb1.proxy.daytona.work"
        );
    }

    #[test]
    fn test_normalize_keeps_valid_urls() {
        assert_eq!(normalize_preview_url("https://host/path").unwrap(), "https://host/path");
        assert_eq!(normalize_preview_url(" http://127.0.0.1:3000 ").unwrap(), "http://127.0.0.1:3000");
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert!(matches!(
            normalize_preview_url("  "),
            Err(ProxyError::UpstreamResolution(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_url_escapes_sandbox_id() {
        let client = build_http_client(&UpstreamConfig::default());
        let resolver = DaytonaPreviewResolver::new(client, "https://app.daytona.io/api/", "key");
        assert_eq!(
            resolver.lookup_url("sb-1", 3000),
            "https://app.daytona.io/api/sandbox/sb-1/ports/3000/preview-url"
        );
        assert_eq!(
            resolver.lookup_url("a/b?c", 80),
            "https://app.daytona.io/api/sandbox/a%2Fb%3Fc/ports/80/preview-url"
        );
    }

    #[test]
    fn test_payload_tolerates_missing_token() {
        let payload: PreviewLinkPayload =
            serde_json::from_str(r#"{"sandboxId":"sb1","url":"https://x"}"#).unwrap();
        assert_eq!(payload.url.as_deref(), Some("https://x"));
        assert!(payload.token.is_none());
    }
}
