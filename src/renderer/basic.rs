//! Thin renderers
//!
//! These reuse the pipeline contract without any rendering machinery:
//! robots.txt content, response-header injection, path rewriting, an
//! unconditional default page and the terminal error renderer.

use crate::error::SsrError;
use crate::renderer::{Renderer, RendererRef, RequestContext};
use crate::vm::ServerInfo;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use async_trait::async_trait;
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// robots.txt renderer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RobotsConfig {
    /// Literal robots.txt body.
    pub content: String,
}

/// Serves the configured content on `/robots.txt`, delegates otherwise.
pub struct RobotsRenderer {
    config: RobotsConfig,
    next: RendererRef,
}

impl RobotsRenderer {
    /// Builds the renderer.
    pub fn new(config: RobotsConfig, next: RendererRef) -> Self {
        Self { config, next }
    }
}

#[async_trait(?Send)]
impl Renderer for RobotsRenderer {
    async fn handle(&self, ctx: &mut RequestContext, info: &ServerInfo) -> HttpResponse {
        if ctx.path() == "/robots.txt" {
            return HttpResponse::Ok()
                .content_type("text/plain; charset=utf-8")
                .body(self.config.content.clone());
        }
        self.next.handle(ctx, info).await
    }
}

/// Response-header renderer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderConfig {
    /// Headers added to every response passing through.
    pub headers: IndexMap<String, String>,
}

/// Startup-parsed header set.
#[derive(Clone)]
pub struct PreparedHeaders {
    headers: Vec<(HeaderName, HeaderValue)>,
}

/// Parses the configured headers; malformed names or values are fatal.
pub fn prepare_headers(config: &HeaderConfig) -> Result<PreparedHeaders, SsrError> {
    let mut headers = Vec::with_capacity(config.headers.len());
    for (key, value) in &config.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| SsrError::Config(format!("header renderer: invalid name '{key}': {e}")))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            SsrError::Config(format!("header renderer: invalid value for '{key}': {e}"))
        })?;
        headers.push((name, value));
    }
    Ok(PreparedHeaders { headers })
}

/// Delegates, then adds the configured headers to the response.
pub struct HeaderRenderer {
    prepared: PreparedHeaders,
    next: RendererRef,
}

impl HeaderRenderer {
    /// Builds the renderer.
    pub fn new(prepared: PreparedHeaders, next: RendererRef) -> Self {
        Self { prepared, next }
    }
}

#[async_trait(?Send)]
impl Renderer for HeaderRenderer {
    async fn handle(&self, ctx: &mut RequestContext, info: &ServerInfo) -> HttpResponse {
        let mut response = self.next.handle(ctx, info).await;
        for (name, value) in &self.prepared.headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
        response
    }
}

/// Path-rewrite renderer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteConfig {
    /// Rewrite rules tried in order; the first matching one applies.
    pub rules: Vec<RewriteRule>,
}

/// One rewrite rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRule {
    /// Path regex.
    pub path: String,
    /// Replacement, may reference capture groups with `$name` / `$N`.
    pub replacement: String,
}

/// Startup-compiled rewrite rules.
#[derive(Clone)]
pub struct PreparedRewrite {
    rules: Vec<(Regex, String)>,
}

/// Compiles the rewrite regexes; an invalid one is fatal.
pub fn prepare_rewrite(config: &RewriteConfig) -> Result<PreparedRewrite, SsrError> {
    let rules = config
        .rules
        .iter()
        .map(|rule| {
            Regex::new(&rule.path)
                .map(|re| (re, rule.replacement.clone()))
                .map_err(|e| {
                    SsrError::Config(format!(
                        "rewrite renderer: invalid regex '{}': {e}",
                        rule.path
                    ))
                })
        })
        .collect::<Result<Vec<_>, SsrError>>()?;
    Ok(PreparedRewrite { rules })
}

/// Rewrites the effective path, then delegates.
pub struct RewriteRenderer {
    prepared: PreparedRewrite,
    next: RendererRef,
}

impl RewriteRenderer {
    /// Builds the renderer.
    pub fn new(prepared: PreparedRewrite, next: RendererRef) -> Self {
        Self { prepared, next }
    }
}

#[async_trait(?Send)]
impl Renderer for RewriteRenderer {
    async fn handle(&self, ctx: &mut RequestContext, info: &ServerInfo) -> HttpResponse {
        for (regex, replacement) in &self.prepared.rules {
            if regex.is_match(ctx.path()) {
                let rewritten = regex.replace(ctx.path(), replacement.as_str()).into_owned();
                ctx.set_path(rewritten);
                break;
            }
        }
        self.next.handle(ctx, info).await
    }
}

/// Default renderer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultConfig {
    /// File served for every request reaching this renderer.
    pub file: PathBuf,
    /// Response status.
    #[serde(default = "default_status")]
    pub status: u16,
}

fn default_status() -> u16 {
    200
}

/// Serves one configured file unconditionally; delegates only when the
/// file cannot be read.
pub struct DefaultRenderer {
    config: DefaultConfig,
    next: RendererRef,
}

impl DefaultRenderer {
    /// Builds the renderer.
    pub fn new(config: DefaultConfig, next: RendererRef) -> Self {
        Self { config, next }
    }
}

#[async_trait(?Send)]
impl Renderer for DefaultRenderer {
    async fn handle(&self, ctx: &mut RequestContext, info: &ServerInfo) -> HttpResponse {
        match fs::read(&self.config.file) {
            Ok(body) => {
                let status =
                    StatusCode::from_u16(self.config.status).unwrap_or(StatusCode::OK);
                let mime = mime_guess::from_path(&self.config.file).first_or_octet_stream();
                HttpResponse::build(status)
                    .content_type(mime.as_ref())
                    .body(body)
            }
            Err(err) => {
                tracing::warn!(
                    target: "vitrine::renderer",
                    file = %self.config.file.display(),
                    error = %err,
                    "default renderer failed to read file"
                );
                self.next.handle(ctx, info).await
            }
        }
    }
}

/// Terminal renderer: always responds with 500.
pub struct ErrorRenderer;

impl ErrorRenderer {
    /// Builds the renderer.
    pub fn new() -> Self {
        Self
    }
}

impl Default for ErrorRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Renderer for ErrorRenderer {
    async fn handle(&self, ctx: &mut RequestContext, _info: &ServerInfo) -> HttpResponse {
        tracing::debug!(
            target: "vitrine::renderer",
            path = ctx.path(),
            correlation_id = ctx.correlation_id(),
            "request fell through to the error renderer"
        );
        HttpResponse::InternalServerError()
            .content_type("text/plain; charset=utf-8")
            .body("Internal Server Error")
    }
}
