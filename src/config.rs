use crate::identity::{DEFAULT_ROUTE_PREFIX, RouteTemplate};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const ENV_API_KEY: &str = "DAYTONA_API_KEY";
pub const ENV_API_URL: &str = "DAYTONA_API_URL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_level_filter().as_str().to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// Connection details for the preview-URL lookup service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewApiConfig {
    /// Base URL of the sandbox API (e.g. `https://app.daytona.io/api`).
    #[serde(default)]
    pub api_url: Option<String>,
    /// Bearer key; may be stored as `{encrypted}<base64>`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_token_header")]
    pub token_header: String,
    #[serde(default = "default_skip_warning_header")]
    pub skip_warning_header: String,
}

fn default_token_header() -> String {
    "X-Daytona-Preview-Token".to_string()
}

fn default_skip_warning_header() -> String {
    "X-Daytona-Skip-Preview-Warning".to_string()
}

impl Default for PreviewApiConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            token_header: default_token_header(),
            skip_warning_header: default_skip_warning_header(),
        }
    }
}

/// Outbound client settings for sandbox and lookup requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Bound on each upstream await (resolution, response head). Default: 60s
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    /// Maximum idle connections kept per sandbox host. Default: 10
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    /// Default: 90s
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upstream_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRuleConfig {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Directory the sandboxed framework serves its build assets from.
    #[serde(default = "default_asset_prefix")]
    pub asset_prefix: String,
    #[serde(default)]
    pub extra_html_rules: Vec<RewriteRuleConfig>,
    #[serde(default)]
    pub extra_css_rules: Vec<RewriteRuleConfig>,
}

fn default_asset_prefix() -> String {
    "_next".to_string()
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            asset_prefix: default_asset_prefix(),
            extra_html_rules: Vec::new(),
            extra_css_rules: Vec::new(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_route_prefix() -> String {
    DEFAULT_ROUTE_PREFIX.to_string()
}

fn default_allowed_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,
    // Explicit segment positions; default to the two segments after the prefix
    #[serde(default)]
    pub sandbox_segment_index: Option<usize>,
    #[serde(default)]
    pub port_segment_index: Option<usize>,
    #[serde(default)]
    pub preview_api: PreviewApiConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    // Logs a preview of buffered bodies; never changes the response
    #[serde(default)]
    pub debug_body_preview: bool,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            route_prefix: default_route_prefix(),
            sandbox_segment_index: None,
            port_segment_index: None,
            preview_api: PreviewApiConfig::default(),
            upstream: UpstreamConfig::default(),
            allowed_methods: default_allowed_methods(),
            rewrite: RewriteConfig::default(),
            debug_body_preview: false,
            private_key: None,
            certificate: None,
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fill the API credentials from the environment when the file left them out.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.preview_api.api_key.is_none() {
            self.preview_api.api_key = lookup(ENV_API_KEY).filter(|v| !v.is_empty());
        }
        if self.preview_api.api_url.is_none() {
            self.preview_api.api_url = lookup(ENV_API_URL).filter(|v| !v.is_empty());
        }
    }

    pub fn route_template(&self) -> RouteTemplate {
        let mut template = RouteTemplate::from_prefix(&self.route_prefix);
        if let Some(idx) = self.sandbox_segment_index {
            template.sandbox_index = idx;
        }
        if let Some(idx) = self.port_segment_index {
            template.port_index = idx;
        }
        template
    }

    pub fn is_method_allowed(&self, method: &str) -> bool {
        self.allowed_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"preview_api": {"api_url": "https://api.example.com", "api_key": "k"}}"#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, default_listen_addr());
        assert_eq!(config.route_prefix, "/api/proxy/preview");
        assert_eq!(config.preview_api.token_header, "X-Daytona-Preview-Token");
        assert_eq!(config.upstream.timeout_secs, 60);
        assert_eq!(config.rewrite.asset_prefix, "_next");
        assert!(config.is_method_allowed("patch"));
        assert!(!config.is_method_allowed("TRACE"));
    }

    #[test]
    fn test_env_overrides_only_fill_missing_values() {
        let mut config = Config::default();
        config.preview_api.api_url = Some("https://from-file".to_string());
        config.apply_overrides_from(|name| match name {
            ENV_API_KEY => Some("env-key".to_string()),
            ENV_API_URL => Some("https://from-env".to_string()),
            _ => None,
        });
        assert_eq!(config.preview_api.api_key.as_deref(), Some("env-key"));
        assert_eq!(config.preview_api.api_url.as_deref(), Some("https://from-file"));
    }

    #[test]
    fn test_route_template_with_explicit_indices() {
        let mut config = Config::default();
        config.route_prefix = "/preview".to_string();
        assert_eq!(config.route_template().sandbox_index, 1);
        config.sandbox_segment_index = Some(2);
        config.port_segment_index = Some(1);
        let template = config.route_template();
        assert_eq!(template.sandbox_index, 2);
        assert_eq!(template.port_index, 1);
    }

    #[test]
    fn test_round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let path = path.to_str().unwrap();
        let mut config = Config::default();
        config.debug_body_preview = true;
        config.to_file(path).unwrap();
        let loaded = Config::from_file(path).unwrap();
        assert!(loaded.debug_body_preview);
        assert_eq!(loaded.allowed_methods, config.allowed_methods);
    }
}
