use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Malformed path: expected at least {expected} segments, got {actual}")]
    MalformedPath { expected: usize, actual: usize },

    #[error("Invalid port segment: {0}")]
    InvalidPort(String),

    #[error("Upstream resolution error: {0}")]
    UpstreamResolution(String),

    #[error("Upstream request error: {0}")]
    UpstreamRequest(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

impl ProxyError {
    /// Short stable label used for metrics and log correlation.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MalformedPath { .. } => "malformed_path",
            ProxyError::InvalidPort(_) => "invalid_port",
            ProxyError::UpstreamResolution(_) => "upstream_resolution",
            ProxyError::UpstreamRequest(_) => "upstream_request",
            ProxyError::Unexpected(_) => "unexpected",
            ProxyError::Io(_) => "io",
            ProxyError::Config(_) => "config",
            ProxyError::Secret(_) => "secret",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        let err = ProxyError::MalformedPath { expected: 5, actual: 2 };
        assert_eq!(err.kind(), "malformed_path");
        assert_eq!(
            err.to_string(),
            "Malformed path: expected at least 5 segments, got 2"
        );
        assert_eq!(ProxyError::InvalidPort("abc".into()).kind(), "invalid_port");
    }
}
