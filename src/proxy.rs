use crate::config::Config;
use crate::error::ProxyError;
use crate::forwarding::{EngineSettings, ForwardingEngine, ProxyBody, build_http_client};
use crate::identity::RouteTemplate;
use crate::monitoring::{Outcome, ProxyMetrics, health_response, plain_response};
use crate::resolver::{DaytonaPreviewResolver, PreviewResolver};
use crate::rewrite::RewriteRules;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{ALLOW, HeaderValue};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use rustls::ServerConfig;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Create TLS server configuration from certificate and private key files
fn create_tls_config(private_key_path: &str, cert_path: &str) -> Result<ServerConfig, ProxyError> {
    let mut private_key_file = BufReader::new(
        File::open(private_key_path)
            .map_err(|e| ProxyError::Config(format!("Failed to open private key file: {}", e)))?,
    );
    let mut cert_file = BufReader::new(
        File::open(cert_path)
            .map_err(|e| ProxyError::Config(format!("Failed to open certificate file: {}", e)))?,
    );

    let certs = rustls_pemfile::certs(&mut cert_file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("Failed to read certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Config("No valid certificate found".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut private_key_file)
        .map_err(|e| ProxyError::Config(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Config("No valid private key found".to_string()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| ProxyError::Config(format!("Failed to create TLS config: {}", e)))
}

/// Decides what each inbound request is: a health or metrics check, a
/// proxied preview request, or something to reject.
pub struct PreviewRouter {
    engine: ForwardingEngine,
    route: RouteTemplate,
    allowed_methods: Vec<Method>,
    metrics: ProxyMetrics,
}

impl PreviewRouter {
    pub fn new(engine: ForwardingEngine, allowed_methods: &[String], metrics: ProxyMetrics) -> Result<Self, ProxyError> {
        let allowed_methods = allowed_methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                    .map_err(|_| ProxyError::Config(format!("Invalid HTTP method: {}", m)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let route = engine.settings().route.clone();
        Ok(Self {
            engine: engine.with_metrics(metrics.clone()),
            route,
            allowed_methods,
            metrics,
        })
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    pub async fn dispatch(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let path = req.uri().path();

        if *req.method() == Method::GET {
            match path {
                "/health" => return health_response(),
                "/metrics" => return self.metrics.metrics_response(),
                _ => {}
            }
        }

        if !self.route.matches(path) {
            debug!("No route for {} {}", req.method(), path);
            return plain_response(StatusCode::NOT_FOUND, "Not Found");
        }

        if !self.allowed_methods.contains(req.method()) {
            warn!("Rejecting {} {}: method not allowed", req.method(), path);
            self.metrics.record(Outcome::Rejected);
            return self.method_not_allowed();
        }

        self.engine.handle(req).await
    }

    fn method_not_allowed(&self) -> Response<ProxyBody> {
        let mut response = plain_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        let allow = self
            .allowed_methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&allow) {
            response.headers_mut().insert(ALLOW, value);
        }
        response
    }
}

pub struct PreviewServer {
    router: Arc<PreviewRouter>,
    addr: SocketAddr,
    private_key: Option<String>,
    certificate: Option<String>,
}

impl PreviewServer {
    /// Wire the engine to the Daytona resolver described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let api_url = config
            .preview_api
            .api_url
            .as_deref()
            .ok_or_else(|| ProxyError::Config("preview_api.api_url is not set".to_string()))?;
        let api_key = config
            .preview_api
            .api_key
            .as_deref()
            .ok_or_else(|| ProxyError::Config("preview_api.api_key is not set".to_string()))?;

        let client = build_http_client(&config.upstream);
        let resolver: Arc<dyn PreviewResolver> =
            Arc::new(DaytonaPreviewResolver::new(client, api_url, api_key));
        Self::with_resolver(config, resolver)
    }

    pub fn with_resolver(config: &Config, resolver: Arc<dyn PreviewResolver>) -> Result<Self, ProxyError> {
        let settings = EngineSettings::from_config(config)?;
        let rules = RewriteRules::from_config(&config.rewrite)?;
        let metrics = ProxyMetrics::new()?;
        let engine = ForwardingEngine::new(settings, resolver, rules);
        let router = PreviewRouter::new(engine, &config.allowed_methods, metrics)?;

        Ok(Self {
            router: Arc::new(router),
            addr: config.listen_addr,
            private_key: config.private_key.clone(),
            certificate: config.certificate.clone(),
        })
    }

    pub fn router(&self) -> Arc<PreviewRouter> {
        self.router.clone()
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        match (self.private_key.as_deref(), self.certificate.as_deref()) {
            (Some(private_key_path), Some(cert_path)) => {
                info!("Enabling HTTPS/TLS mode");
                debug!("Loading TLS certificate from: {}", cert_path);
                debug!("Loading TLS private key from: {}", private_key_path);
                let tls_config = create_tls_config(private_key_path, cert_path)?;
                let acceptor = TlsAcceptor::from(Arc::new(tls_config));

                let listener = TcpListener::bind(self.addr).await?;
                info!("Preview proxy listening on: https://{}", self.addr);
                serve_tls(listener, acceptor, self.router).await
            }
            _ => {
                let listener = TcpListener::bind(self.addr).await?;
                info!("Preview proxy listening on: http://{}", self.addr);
                serve(listener, self.router).await
            }
        }
    }
}

async fn route_incoming(
    router: Arc<PreviewRouter>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    Ok(router.dispatch(req.map(|body| body.boxed())).await)
}

/// Accept plain HTTP connections on `listener` until an accept error occurs.
pub async fn serve(listener: TcpListener, router: Arc<PreviewRouter>) -> Result<(), ProxyError> {
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let router = router.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| route_incoming(router.clone(), req));
            if let Err(err) = ServerBuilder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                error!("Error serving HTTP connection from {}: {}", remote_addr, err);
            }
        });
    }
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Arc<PreviewRouter>,
) -> Result<(), ProxyError> {
    loop {
        let (tcp_stream, remote_addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Error establishing TLS connection from {}: {}", remote_addr, e);
                    return;
                }
            };
            let service = service_fn(move |req| route_incoming(router.clone(), req));
            if let Err(e) = ServerBuilder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                error!("Error serving TLS connection from {}: {}", remote_addr, e);
            }
        });
    }
}
