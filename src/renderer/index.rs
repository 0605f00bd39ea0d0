//! SSR index renderer
//!
//! Matches the request path against its rules, assembles the hydration
//! state from cached upstream payloads, executes the bundle in a pooled VM
//! and splices the result into the HTML shell. Any failure along the way
//! falls through to the next renderer.

use crate::error::SsrError;
use crate::renderer::html::{splice, SpliceInputs};
use crate::renderer::{Renderer, RendererRef, RequestContext, Services};
use crate::template::substitute_captures;
use crate::vm::ServerInfo;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Index renderer configuration as it appears in the pipeline composition.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Path to the HTML shell.
    pub html: PathBuf,
    /// Path to the JS bundle; without one the shell is served as-is.
    #[serde(default)]
    pub bundle: Option<PathBuf>,
    /// Id of the element receiving the rendered fragment.
    #[serde(default = "default_container")]
    pub container: String,
    /// Id of the hydration state script tag.
    #[serde(default = "default_state")]
    pub state: String,
    /// Bundle execution deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Cache finished responses under the request path.
    #[serde(default)]
    pub cache: bool,
    /// TTL in seconds for cached responses; 0 keeps them until restart.
    #[serde(default)]
    pub cache_ttl: i64,
    /// Route rules evaluated in declaration order.
    #[serde(default)]
    pub rules: Vec<IndexRuleConfig>,
}

fn default_container() -> String {
    "root".to_string()
}

fn default_state() -> String {
    "state".to_string()
}

fn default_timeout() -> u64 {
    5
}

/// One route rule: a path regex plus the state entries it contributes.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexRuleConfig {
    /// Path regex; capture groups feed `$name` / `$N` substitution.
    pub path: String,
    /// State entries computed when the rule matches.
    #[serde(default)]
    pub state: Vec<StateEntryConfig>,
    /// Stop evaluating further rules after this one matches.
    #[serde(default)]
    pub last: bool,
}

/// One state entry of a rule.
#[derive(Debug, Clone, Deserialize)]
pub struct StateEntryConfig {
    /// State key; may reference capture groups.
    pub key: String,
    /// Resource name; may reference capture groups.
    pub resource: String,
    /// Include this entry in the serialized hydration script.
    #[serde(default)]
    pub export: bool,
}

/// Startup-validated index configuration: regexes compiled, ids checked,
/// shell verified to exist.
#[derive(Clone)]
pub struct PreparedIndex {
    html: PathBuf,
    bundle: Option<PathBuf>,
    container: String,
    state: String,
    timeout: Duration,
    cache: bool,
    cache_ttl: i64,
    rules: Vec<PreparedRule>,
}

#[derive(Clone)]
struct PreparedRule {
    path: Regex,
    state: Vec<StateEntryConfig>,
    last: bool,
}

fn valid_element_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validates an index configuration. An invalid rule regex, a malformed
/// element id or a missing shell file is fatal.
pub fn prepare(config: &IndexConfig) -> Result<PreparedIndex, SsrError> {
    if !config.html.is_file() {
        return Err(SsrError::Config(format!(
            "index renderer: HTML shell not found: {}",
            config.html.display()
        )));
    }
    if !valid_element_id(&config.container) {
        return Err(SsrError::Config(format!(
            "index renderer: invalid container id '{}'",
            config.container
        )));
    }
    if !valid_element_id(&config.state) {
        return Err(SsrError::Config(format!(
            "index renderer: invalid state id '{}'",
            config.state
        )));
    }

    let rules = config
        .rules
        .iter()
        .map(|rule| {
            let path = Regex::new(&rule.path).map_err(|e| {
                SsrError::Config(format!("index renderer: invalid rule regex '{}': {e}", rule.path))
            })?;
            Ok(PreparedRule {
                path,
                state: rule.state.clone(),
                last: rule.last,
            })
        })
        .collect::<Result<Vec<_>, SsrError>>()?;

    Ok(PreparedIndex {
        html: config.html.clone(),
        bundle: config.bundle.clone(),
        container: config.container.clone(),
        state: config.state.clone(),
        timeout: Duration::from_secs(config.timeout.max(1)),
        cache: config.cache,
        cache_ttl: config.cache_ttl,
        rules,
    })
}

/// A finished response stored in the page cache.
#[derive(Debug, Clone)]
pub struct CachedPage {
    /// Response status.
    pub status: u16,
    /// Spliced HTML bytes.
    pub body: Bytes,
}

/// One state entry value as serialized for hydration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct StateValue {
    loading: bool,
    error: String,
    response: String,
}

impl StateValue {
    fn loaded(response: String) -> Self {
        Self {
            loading: false,
            error: String::new(),
            response,
        }
    }

    fn loading() -> Self {
        Self {
            loading: true,
            error: String::new(),
            response: String::new(),
        }
    }

    fn unknown() -> Self {
        Self {
            loading: false,
            error: "unknown resource".to_string(),
            response: String::new(),
        }
    }
}

/// A source file re-read only when its stat changes.
struct SourceFile {
    path: PathBuf,
    cached: Mutex<Option<(Option<SystemTime>, u64, Arc<Vec<u8>>)>>,
}

impl SourceFile {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Arc<Vec<u8>>, SsrError> {
        let metadata = fs::metadata(&self.path)
            .map_err(|e| SsrError::io(self.path.display().to_string(), e))?;
        let mtime = metadata.modified().ok();
        let len = metadata.len();

        let mut cached = self.cached.lock();
        if let Some((cached_mtime, cached_len, bytes)) = cached.as_ref() {
            if *cached_mtime == mtime && mtime.is_some() && *cached_len == len {
                return Ok(Arc::clone(bytes));
            }
        }
        let bytes = Arc::new(
            fs::read(&self.path).map_err(|e| SsrError::io(self.path.display().to_string(), e))?,
        );
        *cached = Some((mtime, len, Arc::clone(&bytes)));
        Ok(bytes)
    }
}

/// The SSR renderer.
pub struct IndexRenderer {
    html: SourceFile,
    bundle: Option<SourceFile>,
    config: PreparedIndex,
    services: Services,
    next: RendererRef,
}

impl IndexRenderer {
    /// Builds the renderer from a validated configuration.
    pub fn new(config: PreparedIndex, services: Services, next: RendererRef) -> Self {
        Self {
            html: SourceFile::new(&config.html),
            bundle: config.bundle.as_ref().map(SourceFile::new),
            config,
            services,
            next,
        }
    }

    /// Computes the state entries for the effective path, in rule then
    /// entry declaration order. The bool marks exported entries.
    fn assemble_state(&self, path: &str) -> IndexMap<String, (StateValue, bool)> {
        let mut state = IndexMap::new();
        for rule in &self.config.rules {
            let Some(caps) = rule.path.captures(path) else {
                continue;
            };
            for entry in &rule.state {
                let key = substitute_captures(&entry.key, &caps);
                let resource = substitute_captures(&entry.resource, &caps);
                let value = if !self.services.fetcher.exists(&resource) {
                    StateValue::unknown()
                } else {
                    match self.services.fetcher.get(&resource) {
                        Ok(body) => {
                            StateValue::loaded(String::from_utf8_lossy(&body).into_owned())
                        }
                        Err(_) => StateValue::loading(),
                    }
                };
                state.insert(key, (value, entry.export));
            }
            if rule.last {
                break;
            }
        }
        state
    }

    fn page_response(&self, page: &CachedPage) -> HttpResponse {
        let status = StatusCode::from_u16(page.status).unwrap_or(StatusCode::OK);
        HttpResponse::build(status)
            .content_type("text/html; charset=utf-8")
            .body(page.body.clone())
    }

}

#[async_trait(?Send)]
impl Renderer for IndexRenderer {
    async fn handle(&self, ctx: &mut RequestContext, info: &ServerInfo) -> HttpResponse {
        if self.config.cache {
            if let Some(page) = self.services.pages.get(ctx.path()) {
                return self.page_response(&page);
            }
        }

        match self.try_handle(ctx, info).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    target: "vitrine::renderer",
                    path = ctx.path(),
                    correlation_id = ctx.correlation_id(),
                    error = %err,
                    "index render failed, delegating"
                );
                self.next.handle(ctx, info).await
            }
        }
    }
}

impl IndexRenderer {
    async fn try_handle(
        &self,
        ctx: &mut RequestContext,
        info: &ServerInfo,
    ) -> Result<HttpResponse, SsrError> {
        let shell = self.html.read()?;

        let Some(bundle) = &self.bundle else {
            let page = CachedPage {
                status: 200,
                body: Bytes::copy_from_slice(&shell),
            };
            if self.config.cache {
                self.services
                    .pages
                    .set(ctx.path().to_string(), page.clone(), self.config.cache_ttl);
            }
            return Ok(self.page_response(&page));
        };

        let source = bundle.read()?;
        let source = String::from_utf8_lossy(&source).into_owned();
        let bundle_name = bundle
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bundle.js".to_string());

        let state = self.assemble_state(ctx.path());
        let full_state: IndexMap<&String, &StateValue> =
            state.iter().map(|(k, (v, _))| (k, v)).collect();
        let state_json = serde_json::to_string(&full_state)?;
        let exported: IndexMap<&String, &StateValue> = state
            .iter()
            .filter(|(_, (_, export))| *export)
            .map(|(k, (v, _))| (k, v))
            .collect();
        let exported_json = if exported.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&exported)?)
        };

        let vm_request = ctx.vm_request();
        let result = {
            let mut lease = self.services.vm_pool.get().await?;
            lease.configure(&self.services.env, info, &vm_request, Some(&state_json))?;
            lease.execute(&bundle_name, &source, self.config.timeout)?
        };

        if let Some(redirect) = &result.redirect {
            let status = StatusCode::from_u16(redirect.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return Ok(HttpResponse::build(status)
                .insert_header(("Location", redirect.url.clone()))
                .finish());
        }

        let mut out = self.services.buffers.get();
        let inputs = SpliceInputs {
            container: &self.config.container,
            state_id: &self.config.state,
            title: result.title.as_deref(),
            metas: &result.metas,
            links: &result.links,
            scripts: &result.scripts,
            render: &result.render,
            state_json: exported_json.as_deref(),
        };
        let spliced = splice(&shell, &inputs, &mut out);
        let body = Bytes::copy_from_slice(&out);
        self.services.buffers.put(out);
        spliced?;

        let page = CachedPage {
            status: result.status,
            body,
        };
        if self.config.cache {
            self.services
                .pages
                .set(ctx.path().to_string(), page.clone(), self.config.cache_ttl);
        }

        let status = StatusCode::from_u16(page.status).unwrap_or(StatusCode::OK);
        let mut builder = HttpResponse::build(status);
        builder.content_type("text/html; charset=utf-8");
        for (key, value) in &result.headers {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    builder.insert_header((name, value));
                }
                _ => {
                    tracing::debug!(
                        target: "vitrine::renderer",
                        header = key,
                        "skipping invalid script-set header"
                    );
                }
            }
        }
        Ok(builder.body(page.body))
    }
}
