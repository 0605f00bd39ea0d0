//! Renderer pipeline
//!
//! Every request walks an ordered chain of renderers. A renderer either
//! produces the response or delegates to its successor; the chain is wired
//! once at startup in configuration order and always terminated by the
//! error renderer. Renderer chains are built per worker thread (isolates
//! are thread-bound); everything they share — fetcher, caches, VM pool —
//! is `Arc`ed behind [`Services`].

pub mod basic;
pub mod html;
pub mod index;
pub mod statics;

use crate::buffer::BufferPool;
use crate::cache::Cache;
use crate::fetcher::Fetcher;
use crate::vm::{ServerInfo, VmPool, VmRequest};
use actix_web::{HttpRequest, HttpResponse};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

pub use index::CachedPage;

/// One request's mutable view while it walks the chain.
///
/// The effective path starts as the request path and may be changed by a
/// rewrite renderer; rule matching and the bundle's `serverRequest.path()`
/// both see the effective path.
pub struct RequestContext {
    request: HttpRequest,
    path: String,
    correlation_id: String,
}

impl RequestContext {
    /// Wraps an incoming request, assigning it a fresh correlation ID.
    pub fn new(request: HttpRequest) -> Self {
        let path = request.path().to_string();
        Self {
            request,
            path,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// The underlying HTTP request.
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Effective request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Replaces the effective path (rewrite renderer).
    pub fn set_path(&mut self, path: String) {
        self.path = path;
    }

    /// Correlation ID attached to this request.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Snapshots the request for the VM host objects. Query parameters and
    /// headers are pre-serialized to JSON, multi-valued as string arrays.
    pub fn vm_request(&self) -> VmRequest {
        let (proto, proto_major, proto_minor) = protocol_parts(&self.request);

        let mut query: IndexMap<String, Vec<String>> = IndexMap::new();
        for (key, value) in url::form_urlencoded::parse(self.request.query_string().as_bytes()) {
            query.entry(key.into_owned()).or_default().push(value.into_owned());
        }

        let mut headers: IndexMap<String, Vec<String>> = IndexMap::new();
        for (name, value) in self.request.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_str().unwrap_or_default().to_string());
        }

        VmRequest {
            method: self.request.method().as_str().to_string(),
            proto,
            proto_major,
            proto_minor,
            remote_addr: self
                .request
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
            host: self.request.connection_info().host().to_string(),
            path: self.path.clone(),
            query: serde_json::to_string(&query).unwrap_or_else(|_| "{}".to_string()),
            headers: serde_json::to_string(&headers).unwrap_or_else(|_| "{}".to_string()),
        }
    }
}

fn protocol_parts(request: &HttpRequest) -> (String, u16, u16) {
    use actix_web::http::Version;
    let (major, minor) = match request.version() {
        Version::HTTP_09 => (0, 9),
        Version::HTTP_10 => (1, 0),
        Version::HTTP_2 => (2, 0),
        Version::HTTP_3 => (3, 0),
        _ => (1, 1),
    };
    (format!("HTTP/{major}.{minor}"), major, minor)
}

/// A handler in the pipeline. Implementations either write the response or
/// delegate to their successor.
#[async_trait(?Send)]
pub trait Renderer {
    /// Handles the request or delegates down the chain.
    async fn handle(&self, ctx: &mut RequestContext, info: &ServerInfo) -> HttpResponse;
}

/// Shared handle to a renderer in the chain.
pub type RendererRef = Rc<dyn Renderer>;

/// Components shared by every renderer instance across workers.
#[derive(Clone)]
pub struct Services {
    /// Upstream resource registry and cache reader.
    pub fetcher: Arc<Fetcher>,
    /// Cache of finished rendered responses.
    pub pages: Arc<Cache<CachedPage>>,
    /// Byte-buffer pool for the splice path.
    pub buffers: Arc<BufferPool>,
    /// Bounded VM pool.
    pub vm_pool: VmPool,
    /// Environment name exposed as `process.env.ENV`.
    pub env: String,
}

/// Renderer pipeline composition, tagged by kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RendererConfig {
    /// SSR index renderer.
    Index(index::IndexConfig),
    /// Static file renderer.
    Static(statics::StaticConfig),
    /// robots.txt renderer.
    Robots(basic::RobotsConfig),
    /// Response-header renderer.
    Header(basic::HeaderConfig),
    /// Path-rewrite renderer.
    Rewrite(basic::RewriteConfig),
    /// Unconditional default-file renderer.
    Default(basic::DefaultConfig),
}

/// Startup-validated pipeline: regexes compiled, ids checked, mandatory
/// files verified. Building a chain from this cannot fail.
pub enum PreparedRenderer {
    /// SSR index renderer.
    Index(index::PreparedIndex),
    /// Static file renderer.
    Static(statics::StaticConfig),
    /// robots.txt renderer.
    Robots(basic::RobotsConfig),
    /// Response-header renderer.
    Header(basic::PreparedHeaders),
    /// Path-rewrite renderer.
    Rewrite(basic::PreparedRewrite),
    /// Unconditional default-file renderer.
    Default(basic::DefaultConfig),
}

/// Validates the pipeline composition. Invalid regexes, malformed ids and
/// missing mandatory files are fatal here, before the listener starts.
pub fn prepare_renderers(
    configs: &[RendererConfig],
) -> Result<Vec<PreparedRenderer>, crate::error::SsrError> {
    configs
        .iter()
        .map(|config| match config {
            RendererConfig::Index(c) => index::prepare(c).map(PreparedRenderer::Index),
            RendererConfig::Static(c) => Ok(PreparedRenderer::Static(c.clone())),
            RendererConfig::Robots(c) => Ok(PreparedRenderer::Robots(c.clone())),
            RendererConfig::Header(c) => basic::prepare_headers(c).map(PreparedRenderer::Header),
            RendererConfig::Rewrite(c) => basic::prepare_rewrite(c).map(PreparedRenderer::Rewrite),
            RendererConfig::Default(c) => Ok(PreparedRenderer::Default(c.clone())),
        })
        .collect()
}

/// Wires the chain in configuration order, terminated by the error
/// renderer. Called once per worker thread.
pub fn build_chain(prepared: &Arc<Vec<PreparedRenderer>>, services: &Services) -> RendererRef {
    let mut next: RendererRef = Rc::new(basic::ErrorRenderer::new());
    for renderer in prepared.iter().rev() {
        next = match renderer {
            PreparedRenderer::Index(c) => {
                Rc::new(index::IndexRenderer::new(c.clone(), services.clone(), next))
            }
            PreparedRenderer::Static(c) => Rc::new(statics::StaticRenderer::new(c.clone(), next)),
            PreparedRenderer::Robots(c) => Rc::new(basic::RobotsRenderer::new(c.clone(), next)),
            PreparedRenderer::Header(c) => Rc::new(basic::HeaderRenderer::new(c.clone(), next)),
            PreparedRenderer::Rewrite(c) => Rc::new(basic::RewriteRenderer::new(c.clone(), next)),
            PreparedRenderer::Default(c) => Rc::new(basic::DefaultRenderer::new(c.clone(), next)),
        };
    }
    next
}
