//! Upstream resource fetcher
//!
//! The fetcher owns the registry of named upstream endpoints and one shared
//! HTTP client. Fetched bodies land in the TTL cache under the resource
//! name; renderers only ever read the cache, never the network. Retries are
//! driven by the response status: a small set of transient statuses retries
//! with a fixed pause, everything else fails immediately.

use crate::cache::Cache;
use crate::error::SsrError;
use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Statuses that warrant a retry with the configured pause.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Returns true when a response status should be retried.
pub fn should_retry(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// HTTP method of an upstream resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceMethod {
    /// HTTP GET
    #[default]
    Get,
    /// HTTP POST
    Post,
}

impl From<ResourceMethod> for reqwest::Method {
    fn from(method: ResourceMethod) -> Self {
        match method {
            ResourceMethod::Get => reqwest::Method::GET,
            ResourceMethod::Post => reqwest::Method::POST,
        }
    }
}

/// Descriptor for an upstream HTTP endpoint.
///
/// Registered at startup from configuration or instantiated by the loader
/// from a [`Template`]. The fetched body lives in the cache under `name`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Resource {
    /// Unique key; registering the same name again overwrites.
    pub name: String,
    /// HTTP method used for the fetch.
    #[serde(default)]
    pub method: ResourceMethod,
    /// Endpoint URL.
    pub url: String,
    /// Query parameters.
    #[serde(default)]
    pub params: IndexMap<String, String>,
    /// Request headers, overlaid on the fetcher's default headers.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Cache TTL in seconds for the fetched body; 0 means no expiry.
    #[serde(default)]
    pub ttl: i64,
}

/// Blueprint shared by loader-instantiated resources. Same shape as a
/// [`Resource`] minus the TTL; the name is the template's registry key.
#[derive(Debug, Clone, Deserialize)]
pub struct Template {
    /// Template registry key.
    pub name: String,
    /// HTTP method for instantiated resources.
    #[serde(default)]
    pub method: ResourceMethod,
    /// Endpoint URL, usually containing `$field` placeholders.
    pub url: String,
    /// Base query parameters.
    #[serde(default)]
    pub params: IndexMap<String, String>,
    /// Base request headers.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
}

/// HTTP client settings consumed by [`Fetcher::new`].
#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// Timeout in seconds applied to connect and to the whole request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Number of retries after the first attempt on a retryable status.
    #[serde(default = "default_request_retry")]
    pub request_retry: u32,
    /// Fixed pause in seconds between attempts.
    #[serde(default = "default_request_delay")]
    pub request_delay: u64,
    /// Default headers sent with every fetch.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// PEM file with additional root certificates for upstreams.
    #[serde(default)]
    pub tls_ca_file: Option<PathBuf>,
    /// PEM client certificate for mutual TLS.
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,
    /// PEM client key for mutual TLS.
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,
    /// Resources registered at startup.
    #[serde(default)]
    pub resources: Vec<Resource>,
    /// Templates available to the loader.
    #[serde(default)]
    pub templates: Vec<Template>,
}

fn default_request_timeout() -> u64 {
    60
}

fn default_request_retry() -> u32 {
    3
}

fn default_request_delay() -> u64 {
    1
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            request_retry: default_request_retry(),
            request_delay: default_request_delay(),
            headers: IndexMap::new(),
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            resources: Vec::new(),
            templates: Vec::new(),
        }
    }
}

/// Registry of upstream resources plus the shared HTTP client.
pub struct Fetcher {
    client: reqwest::Client,
    resources: RwLock<HashMap<String, Resource>>,
    templates: HashMap<String, Template>,
    cache: Arc<Cache<Bytes>>,
    retry: u32,
    delay: Duration,
}

impl Fetcher {
    /// Builds the fetcher: one reused HTTP client with the configured
    /// timeout, default headers and optional mutual TLS, plus the startup
    /// resources and templates.
    pub fn new(config: &FetcherConfig, cache: Arc<Cache<Bytes>>) -> Result<Self, SsrError> {
        let timeout = Duration::from_secs(config.request_timeout);
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .default_headers(build_header_map(&config.headers)?);

        if let Some(ca) = &config.tls_ca_file {
            let pem = fs::read(ca).map_err(|e| SsrError::io(ca.display().to_string(), e))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| SsrError::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&config.tls_cert_file, &config.tls_key_file) {
            let mut pem = fs::read(cert).map_err(|e| SsrError::io(cert.display().to_string(), e))?;
            let key_pem = fs::read(key).map_err(|e| SsrError::io(key.display().to_string(), e))?;
            pem.extend_from_slice(&key_pem);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| SsrError::Config(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| SsrError::Config(format!("failed to build HTTP client: {e}")))?;

        let resources = config
            .resources
            .iter()
            .map(|r| (r.name.clone(), r.clone()))
            .collect();
        let templates = config
            .templates
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();

        Ok(Self {
            client,
            resources: RwLock::new(resources),
            templates,
            cache,
            retry: config.request_retry,
            delay: Duration::from_secs(config.request_delay),
        })
    }

    /// Registers a resource, overwriting any previous one with the same name.
    pub fn register(&self, resource: Resource) {
        self.resources
            .write()
            .insert(resource.name.clone(), resource);
    }

    /// Removes a resource from the registry. Its cached body, if any, stays
    /// in the cache until it expires.
    pub fn unregister(&self, name: &str) {
        self.resources.write().remove(name);
    }

    /// True when a resource with this name is registered.
    pub fn exists(&self, name: &str) -> bool {
        self.resources.read().contains_key(name)
    }

    /// Returns the last cached body for `name`, or a cache-miss error when
    /// absent or expired.
    pub fn get(&self, name: &str) -> Result<Bytes, SsrError> {
        self.cache
            .get(name)
            .ok_or_else(|| SsrError::CacheMiss(name.to_string()))
    }

    /// Produces a resource from a template, overlaying the template's params
    /// and headers with the caller's.
    pub fn create_resource_from_template(
        &self,
        template_name: &str,
        new_name: &str,
        params: &IndexMap<String, String>,
        headers: &IndexMap<String, String>,
    ) -> Result<Resource, SsrError> {
        let template = self
            .templates
            .get(template_name)
            .ok_or_else(|| SsrError::UnknownTemplate(template_name.to_string()))?;

        let mut merged_params = template.params.clone();
        for (k, v) in params {
            merged_params.insert(k.clone(), v.clone());
        }
        let mut merged_headers = template.headers.clone();
        for (k, v) in headers {
            merged_headers.insert(k.clone(), v.clone());
        }

        Ok(Resource {
            name: new_name.to_string(),
            method: template.method,
            url: template.url.clone(),
            params: merged_params,
            headers: merged_headers,
            ttl: 0,
        })
    }

    /// Fetches the resource's endpoint and stores the body bytes in the
    /// cache under the resource name with the resource's TTL.
    ///
    /// Retries up to the configured count on a retryable status with a
    /// fixed pause between attempts; any other non-2xx status and every
    /// transport error fails immediately.
    pub async fn fetch(&self, name: &str) -> Result<(), SsrError> {
        // Clone out of the registry so the HTTP round-trip runs unlocked
        // and fetches proceed concurrently.
        let resource = {
            let resources = self.resources.read();
            resources
                .get(name)
                .cloned()
                .ok_or_else(|| SsrError::UnknownResource(name.to_string()))?
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            tracing::debug!(
                target: "vitrine::fetcher",
                resource = %resource.name,
                url = %resource.url,
                attempt,
                "fetching resource"
            );

            let response = self
                .client
                .request(resource.method.into(), &resource.url)
                .query(&resource.params.iter().collect::<Vec<_>>())
                .headers(build_header_map(&resource.headers)?)
                .send()
                .await
                .map_err(|e| SsrError::UpstreamUnavailable {
                    resource: resource.name.clone(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if status.is_success() {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| SsrError::UpstreamUnavailable {
                        resource: resource.name.clone(),
                        reason: e.to_string(),
                    })?;
                self.cache.set(resource.name.clone(), body, resource.ttl);
                return Ok(());
            }

            if should_retry(status.as_u16()) && attempt <= self.retry {
                tracing::debug!(
                    target: "vitrine::fetcher",
                    resource = %resource.name,
                    status = status.as_u16(),
                    attempt,
                    "retryable status, pausing before next attempt"
                );
                tokio::time::sleep(self.delay).await;
                continue;
            }

            return Err(SsrError::UpstreamUnavailable {
                resource: resource.name.clone(),
                reason: format!("status {}", status.as_u16()),
            });
        }
    }
}

fn build_header_map(headers: &IndexMap<String, String>) -> Result<HeaderMap, SsrError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| SsrError::Config(format!("invalid header name '{k}': {e}")))?;
        let value = HeaderValue::from_str(v)
            .map_err(|e| SsrError::Config(format!("invalid header value for '{k}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn test_fetcher(config: FetcherConfig) -> Fetcher {
        Fetcher::new(&config, Arc::new(Cache::new())).unwrap()
    }

    fn named(name: &str, url: &str) -> Resource {
        Resource {
            name: name.to_string(),
            url: url.to_string(),
            ..Resource::default()
        }
    }

    #[test]
    fn retry_statuses_are_exactly_the_transient_set() {
        for status in [429, 500, 502, 503, 504] {
            assert!(should_retry(status), "status {status} must retry");
        }
        for status in [301, 400, 401, 403, 404, 418, 501, 505] {
            assert!(!should_retry(status), "status {status} must not retry");
        }
    }

    #[test]
    fn register_unregister_exists() {
        let fetcher = test_fetcher(FetcherConfig::default());
        let resource = named("posts", "http://upstream/posts");
        fetcher.register(resource.clone());
        assert!(fetcher.exists("posts"));
        fetcher.register(resource);
        assert!(fetcher.exists("posts"));
        fetcher.unregister("posts");
        assert!(!fetcher.exists("posts"));
    }

    #[test]
    fn get_reads_the_cache() {
        let cache = Arc::new(Cache::new());
        let fetcher = Fetcher::new(&FetcherConfig::default(), Arc::clone(&cache)).unwrap();
        assert!(matches!(fetcher.get("posts"), Err(SsrError::CacheMiss(_))));
        cache.set("posts", Bytes::from_static(b"[1,2]"), 0);
        assert_eq!(fetcher.get("posts").unwrap(), Bytes::from_static(b"[1,2]"));
    }

    #[test]
    fn template_overlay_prefers_caller_values() {
        let config = FetcherConfig {
            templates: vec![Template {
                name: "item".to_string(),
                method: ResourceMethod::Get,
                url: "http://upstream/items/$id".to_string(),
                params: IndexMap::from([
                    ("page".to_string(), "1".to_string()),
                    ("size".to_string(), "10".to_string()),
                ]),
                headers: IndexMap::from([("accept".to_string(), "application/json".to_string())]),
            }],
            ..FetcherConfig::default()
        };
        let fetcher = test_fetcher(config);

        let params = IndexMap::from([("size".to_string(), "50".to_string())]);
        let headers = IndexMap::from([("authorization".to_string(), "Bearer t".to_string())]);
        let resource = fetcher
            .create_resource_from_template("item", "item-7", &params, &headers)
            .unwrap();

        assert_eq!(resource.name, "item-7");
        assert_eq!(resource.params.get("page").unwrap(), "1");
        assert_eq!(resource.params.get("size").unwrap(), "50");
        assert_eq!(resource.headers.get("accept").unwrap(), "application/json");
        assert_eq!(resource.headers.get("authorization").unwrap(), "Bearer t");

        assert!(matches!(
            fetcher.create_resource_from_template("nope", "x", &params, &headers),
            Err(SsrError::UnknownTemplate(_))
        ));
    }

    #[tokio::test]
    async fn fetch_unknown_resource_errors() {
        let fetcher = test_fetcher(FetcherConfig::default());
        assert!(matches!(
            fetcher.fetch("missing").await,
            Err(SsrError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn transport_error_fails_without_retry() {
        let config = FetcherConfig {
            request_timeout: 2,
            request_retry: 3,
            request_delay: 2,
            ..FetcherConfig::default()
        };
        let fetcher = test_fetcher(config);
        // Discard port: connection refused immediately.
        fetcher.register(named("dead", "http://127.0.0.1:9/x"));

        let start = Instant::now();
        let result = fetcher.fetch("dead").await;
        assert!(matches!(
            result,
            Err(SsrError::UpstreamUnavailable { .. })
        ));
        // With retries the call would pause 2s between attempts; a fast
        // failure proves transport errors are not retried.
        assert!(start.elapsed() < Duration::from_millis(1500));
    }
}
