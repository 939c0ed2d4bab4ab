//! Path-encoded sandbox identity parsing.
//!
//! Inbound paths look like `/<prefix...>/<sandboxId>/<port>/<subpath...>`. The
//! [`RouteTemplate`] knows where the prefix ends and which segments carry the
//! sandbox identity and port, so the engine can be mounted under any prefix.

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ROUTE_PREFIX: &str = "/api/proxy/preview";

/// Sandbox identity extracted from a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxIdentity {
    pub sandbox_id: String,
    pub port: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTemplate {
    pub prefix: Vec<String>,
    pub sandbox_index: usize,
    pub port_index: usize,
}

impl Default for RouteTemplate {
    fn default() -> Self {
        Self::from_prefix(DEFAULT_ROUTE_PREFIX)
    }
}

/// Split a path into its non-empty segments.
pub fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl RouteTemplate {
    /// Template whose identity and port segments directly follow `prefix`.
    pub fn from_prefix(prefix: &str) -> Self {
        let prefix: Vec<String> = split_segments(prefix)
            .into_iter()
            .map(str::to_string)
            .collect();
        let sandbox_index = prefix.len();
        Self {
            prefix,
            sandbox_index,
            port_index: sandbox_index + 1,
        }
    }

    pub fn prefix_path(&self) -> String {
        format!("/{}", self.prefix.join("/"))
    }

    pub fn min_segments(&self) -> usize {
        self.sandbox_index.max(self.port_index) + 1
    }

    /// True when the leading segments of `path` equal the route prefix.
    pub fn matches(&self, path: &str) -> bool {
        let segments = split_segments(path);
        segments.len() >= self.prefix.len()
            && self
                .prefix
                .iter()
                .zip(segments.iter())
                .all(|(expected, actual)| expected == actual)
    }

    /// Extract the sandbox identity and the remaining subpath from `path`.
    pub fn resolve(&self, path: &str) -> Result<(SandboxIdentity, String), ProxyError> {
        let segments = split_segments(path);
        if segments.len() < self.min_segments() {
            return Err(ProxyError::MalformedPath {
                expected: self.min_segments(),
                actual: segments.len(),
            });
        }

        let sandbox_id = segments[self.sandbox_index].to_string();
        let port_segment = segments[self.port_index];
        let port = port_segment
            .parse::<i64>()
            .map_err(|_| ProxyError::InvalidPort(port_segment.to_string()))?;

        let subpath = segments[self.min_segments()..].join("/");
        Ok((SandboxIdentity { sandbox_id, port }, subpath))
    }

    /// Path prefix under which the proxy serves this sandbox port.
    pub fn proxy_prefix(&self, identity: &SandboxIdentity) -> String {
        let mut segments: Vec<String> = Vec::with_capacity(self.min_segments());
        for idx in 0..self.min_segments() {
            if idx == self.sandbox_index {
                segments.push(identity.sandbox_id.clone());
            } else if idx == self.port_index {
                segments.push(identity.port.to_string());
            } else if let Some(fixed) = self.prefix.get(idx) {
                segments.push(fixed.clone());
            }
        }
        format!("/{}", segments.join("/"))
    }
}
