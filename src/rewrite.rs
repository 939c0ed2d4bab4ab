//! Content classification and asset-path rewriting for proxied documents.
//!
//! Only HTML and CSS bodies are rewritten. Everything else is streamed through
//! untouched, since string substitution on scripts or binary payloads would
//! corrupt them.

use crate::config::{RewriteConfig, RewriteRuleConfig};
use crate::error::ProxyError;
use brotli::Decompressor;
use flate2::read::{GzDecoder, ZlibDecoder};
use regex::Regex;
use std::io::{self, Cursor, Read};

const PREFIX_PLACEHOLDER: &str = "{prefix}";

/// Upper bound on a decoded document body.
pub const MAX_DECODED_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Html,
    Css,
    Passthrough,
}

impl ContentClass {
    pub fn classify(content_type: &str) -> Self {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("text/html") {
            ContentClass::Html
        } else if content_type.contains("text/css") {
            ContentClass::Css
        } else {
            ContentClass::Passthrough
        }
    }

    pub fn is_bufferable(self) -> bool {
        !matches!(self, ContentClass::Passthrough)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentClass::Html => "html",
            ContentClass::Css => "css",
            ContentClass::Passthrough => "passthrough",
        }
    }
}

/// A single `(pattern, replacement)` substitution.
///
/// `replacement` uses regex capture syntax (`${1}`) and may contain
/// `{prefix}`, which is replaced by the proxy route prefix at apply time.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

impl RewriteRule {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, ProxyError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| ProxyError::Config(format!("Invalid rewrite pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            pattern,
            replacement: replacement.to_string(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn apply(&self, text: &str, proxy_prefix: &str) -> String {
        let escaped_prefix = proxy_prefix.replace('$', "$$");
        let replacement = self.replacement.replace(PREFIX_PLACEHOLDER, &escaped_prefix);
        self.pattern
            .replace_all(text, replacement.as_str())
            .into_owned()
    }
}

/// Ordered rule sets per bufferable content class.
#[derive(Debug, Clone)]
pub struct RewriteRules {
    html: Vec<RewriteRule>,
    css: Vec<RewriteRule>,
}

impl RewriteRules {
    /// Default rules for a framework whose build assets live under `/<asset_prefix>/`.
    pub fn for_asset_prefix(asset_prefix: &str) -> Result<Self, ProxyError> {
        let trimmed = asset_prefix.trim_matches('/');
        // Escaped for patterns; replacements need the literal with `$` doubled.
        let asset = regex::escape(trimmed);
        let literal = trimmed.replace('$', "$$");

        let html = vec![
            RewriteRule::new(
                &format!(r#"src\s*=\s*(["'])/{asset}/"#),
                &format!("src=${{1}}{{prefix}}/{literal}/"),
            )?,
            RewriteRule::new(
                &format!(r#"href\s*=\s*(["'])/{asset}/"#),
                &format!("href=${{1}}{{prefix}}/{literal}/"),
            )?,
            RewriteRule::new(
                &format!(r#"href\s*=\s*(["'])/{asset}/static/media/"#),
                &format!("href=${{1}}{{prefix}}/{literal}/static/media/"),
            )?,
            RewriteRule::new(
                &format!(r#"src:\s*url\(\s*(["']?)[^)"']*/{asset}/static/media/"#),
                &format!("src: url(${{1}}{{prefix}}/{literal}/static/media/"),
            )?,
        ];

        let css = vec![
            RewriteRule::new(
                &format!(r#"url\s*\(\s*(["']?)/{asset}/"#),
                &format!("url(${{1}}{{prefix}}/{literal}/"),
            )?,
            RewriteRule::new(
                &format!(r#"url\s*\(\s*(["']?)/{asset}/static/"#),
                &format!("url(${{1}}{{prefix}}/{literal}/static/"),
            )?,
            RewriteRule::new(
                r#"url\s*\(\s*(["']?)/static/"#,
                "url(${1}{prefix}/static/",
            )?,
            RewriteRule::new(
                r#"url\s*\(\s*(["']?)/(fonts|images|media|img)/"#,
                "url(${1}{prefix}/${2}/",
            )?,
            RewriteRule::new(
                &format!(r#"url\s*\(\s*(["']?)(/{asset}/[^"')]+)(["']?)\s*\)"#),
                "url(${1}{prefix}${2}${3})",
            )?,
            RewriteRule::new(
                r#"url\s*\(\s*(["']?)(/static/[^"')]+)(["']?)\s*\)"#,
                "url(${1}{prefix}${2}${3})",
            )?,
        ];

        Ok(Self { html, css })
    }

    pub fn from_config(config: &RewriteConfig) -> Result<Self, ProxyError> {
        let mut rules = Self::for_asset_prefix(&config.asset_prefix)?;
        rules.html.extend(compile_extra(&config.extra_html_rules)?);
        rules.css.extend(compile_extra(&config.extra_css_rules)?);
        Ok(rules)
    }

    pub fn rules_for(&self, class: ContentClass) -> &[RewriteRule] {
        match class {
            ContentClass::Html => &self.html,
            ContentClass::Css => &self.css,
            ContentClass::Passthrough => &[],
        }
    }

    /// Apply every rule for `class` in order, each over the previous output.
    pub fn apply(&self, class: ContentClass, body: &str, proxy_prefix: &str) -> String {
        self.rules_for(class)
            .iter()
            .fold(body.to_string(), |text, rule| rule.apply(&text, proxy_prefix))
    }
}

impl Default for RewriteRules {
    fn default() -> Self {
        // The built-in patterns are static and always compile.
        Self::for_asset_prefix("_next").unwrap_or(Self {
            html: Vec::new(),
            css: Vec::new(),
        })
    }
}

fn compile_extra(rules: &[RewriteRuleConfig]) -> Result<Vec<RewriteRule>, ProxyError> {
    rules
        .iter()
        .map(|rule| RewriteRule::new(&rule.pattern, &rule.replacement))
        .collect()
}

/// Undo `content-encoding` so the payload can be rewritten as text.
///
/// Stacked encodings (`gzip, br`) are removed in reverse order of application.
pub fn decode_body(bytes: &[u8], encoding: Option<&str>) -> io::Result<Vec<u8>> {
    decode_body_with_limit(bytes, encoding, MAX_DECODED_BYTES)
}

/// Like [`decode_body`], failing with `InvalidData` once any decoding stage
/// would produce more than `limit` bytes.
pub fn decode_body_with_limit(bytes: &[u8], encoding: Option<&str>, limit: usize) -> io::Result<Vec<u8>> {
    let encodings: Vec<String> = encoding
        .map(|enc| {
            enc.split(',')
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty() && e != "identity")
                .collect()
        })
        .unwrap_or_default();

    let mut data = bytes.to_vec();
    for enc in encodings.iter().rev() {
        data = decode_single(&data, enc, limit)?;
    }
    Ok(data)
}

fn decode_single(bytes: &[u8], encoding: &str, limit: usize) -> io::Result<Vec<u8>> {
    match encoding {
        "gzip" | "x-gzip" => read_capped(GzDecoder::new(Cursor::new(bytes)), limit),
        "deflate" => read_capped(ZlibDecoder::new(Cursor::new(bytes)), limit),
        "br" => read_capped(Decompressor::new(Cursor::new(bytes), 4096), limit),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported content-encoding: {}", other),
        )),
    }
}

fn read_capped<R: Read>(reader: R, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decoded body exceeds {} bytes", limit),
        ));
    }
    Ok(out)
}
