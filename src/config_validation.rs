//! Startup validation for the proxy configuration.
//!
//! Everything the engine needs per request is checked once here so that a bad
//! configuration fails the process at boot instead of failing every request.

use crate::config::Config;
use crate::error::ProxyError;
use crate::rewrite::RewriteRules;
use http::Method;
use std::path::Path;
use url::Url;

/// Comprehensive validation result
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub struct ConfigValidator<'a> {
    config: &'a Config,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        self.validate_preview_api(&mut result);
        self.validate_route(&mut result);
        self.validate_upstream(&mut result);
        self.validate_methods(&mut result);
        self.validate_rewrite(&mut result);
        self.validate_tls(&mut result);
        self.validate_security_implications(&mut result);

        result
    }

    fn validate_preview_api(&self, result: &mut ValidationResult) {
        let api = &self.config.preview_api;

        match api.api_url.as_deref().map(str::trim) {
            None | Some("") => result.add_error(
                "preview_api.api_url is required (or set DAYTONA_API_URL)".to_string(),
            ),
            Some(raw) => match Url::parse(raw) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                    if url.scheme() == "http" {
                        result.add_warning(format!(
                            "preview_api.api_url uses plain HTTP ({}); the API key is sent in clear text",
                            raw
                        ));
                    }
                }
                Ok(url) => result.add_error(format!(
                    "preview_api.api_url must use http or https, got '{}'",
                    url.scheme()
                )),
                Err(e) => result.add_error(format!("preview_api.api_url is invalid: {}", e)),
            },
        }

        match api.api_key.as_deref().map(str::trim) {
            None | Some("") => result.add_error(
                "preview_api.api_key is required (or set DAYTONA_API_KEY)".to_string(),
            ),
            Some(key) if key.starts_with(crate::secrets::SecretManager::encrypted_prefix()) => {
                result.add_error(
                    "preview_api.api_key is still encrypted; decrypt secrets before validation"
                        .to_string(),
                );
            }
            Some(_) => {}
        }

        for (field, name) in [
            ("preview_api.token_header", &api.token_header),
            ("preview_api.skip_warning_header", &api.skip_warning_header),
        ] {
            if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                result.add_error(format!("{} is not a valid header name: '{}'", field, name));
            }
        }
    }

    fn validate_route(&self, result: &mut ValidationResult) {
        if !self.config.route_prefix.starts_with('/') {
            result.add_error(format!(
                "route_prefix must start with '/', got '{}'",
                self.config.route_prefix
            ));
        }

        let template = self.config.route_template();
        let prefix_len = template.prefix.len();
        let (low, high) = if template.sandbox_index < template.port_index {
            (template.sandbox_index, template.port_index)
        } else {
            (template.port_index, template.sandbox_index)
        };

        if template.sandbox_index == template.port_index {
            result.add_error("Sandbox and port segment indices must differ".to_string());
        } else if low != prefix_len || high != low + 1 {
            result.add_error(format!(
                "Sandbox and port segments must be the two segments directly after the {}-segment prefix (got {} and {})",
                prefix_len, template.sandbox_index, template.port_index
            ));
        }

        if prefix_len == 0 {
            result.add_warning(
                "Empty route_prefix: /health and /metrics will shadow sandboxes with those ids"
                    .to_string(),
            );
        }
    }

    fn validate_upstream(&self, result: &mut ValidationResult) {
        let upstream = &self.config.upstream;
        if upstream.timeout_secs == 0 {
            result.add_error("upstream.timeout_secs must be greater than zero".to_string());
        } else if upstream.timeout_secs > 300 {
            result.add_warning(format!(
                "Long upstream timeout ({}s): a hung sandbox holds the caller's request that long",
                upstream.timeout_secs
            ));
        }

        if upstream.pool_max_idle_per_host == 0 {
            result.add_suggestion(
                "Connection pooling is disabled; every request opens a new TLS connection"
                    .to_string(),
            );
        }
    }

    fn validate_methods(&self, result: &mut ValidationResult) {
        if self.config.allowed_methods.is_empty() {
            result.add_error("allowed_methods cannot be empty".to_string());
        } else if !self.config.is_method_allowed("GET") {
            result.add_warning(
                "GET is not in allowed_methods; browsers cannot load previews".to_string(),
            );
        }
        for method in &self.config.allowed_methods {
            match Method::from_bytes(method.as_bytes()) {
                Ok(m) if m == Method::CONNECT => result.add_error(
                    "CONNECT cannot be forwarded by a path-based reverse proxy".to_string(),
                ),
                Ok(_) => {}
                Err(_) => result.add_error(format!("Invalid HTTP method in allowed_methods: '{}'", method)),
            }
        }
    }

    fn validate_rewrite(&self, result: &mut ValidationResult) {
        let rewrite = &self.config.rewrite;
        if rewrite.asset_prefix.trim_matches('/').is_empty() {
            result.add_error("rewrite.asset_prefix cannot be empty".to_string());
        }
        if let Err(e) = RewriteRules::from_config(rewrite) {
            result.add_error(e.to_string());
        }
    }

    fn validate_tls(&self, result: &mut ValidationResult) {
        match (&self.config.private_key, &self.config.certificate) {
            (Some(key), Some(cert)) => {
                for (label, path) in [("private_key", key), ("certificate", cert)] {
                    if !Path::new(path).is_file() {
                        result.add_error(format!("{} file not found: {}", label, path));
                    }
                }
            }
            (Some(_), None) | (None, Some(_)) => result.add_error(
                "private_key and certificate must be configured together".to_string(),
            ),
            (None, None) => {}
        }
    }

    fn validate_security_implications(&self, result: &mut ValidationResult) {
        let ip = self.config.listen_addr.ip();
        if ip.is_unspecified() {
            result.add_warning(format!(
                "Binding to all interfaces ({}) exposes every sandbox preview to external networks",
                ip
            ));
            result.add_suggestion(
                "Place the proxy behind the application's own authentication layer".to_string(),
            );
        }
        if self.config.debug_body_preview {
            result.add_warning(
                "debug_body_preview is enabled; document contents will appear in logs".to_string(),
            );
        }
    }
}

/// Validate and fail fast, returning warnings for the caller to log.
pub fn validate_config(config: &Config) -> Result<ValidationResult, ProxyError> {
    let result = ConfigValidator::new(config).validate();
    if result.is_valid {
        Ok(result)
    } else {
        Err(ProxyError::Config(result.errors.join("; ")))
    }
}
