//! Server configuration
//!
//! One TOML file drives the whole process: listener, fetcher, loader, VM
//! pool and the renderer pipeline composition. Environment variables
//! override the debug flag (`DEBUG`) so existing deployments keep working.
//! Configuration is validated before the listener starts; anything invalid
//! here is fatal.

use crate::error::SsrError;
use crate::fetcher::FetcherConfig;
use crate::loader::{LoaderConfig, LoaderRule};
use crate::renderer::RendererConfig;
use crate::vm::VmPoolConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enable TLS on the listener.
    #[serde(default)]
    pub tls: bool,
    /// PEM file with client CA certificates; enables mutual TLS.
    #[serde(default)]
    pub tls_ca_file: Option<PathBuf>,
    /// PEM server certificate chain.
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,
    /// PEM server private key.
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,
    /// Emit access log lines.
    #[serde(default = "default_true")]
    pub access_log: bool,
    /// Append access log lines to this file instead of the process log.
    #[serde(default)]
    pub access_log_file: Option<PathBuf>,
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            tls: false,
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            access_log: true,
            access_log_file: None,
        }
    }
}

/// Whole-process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Environment name exposed to bundles as `process.env.ENV`.
    #[serde(default = "default_env")]
    pub env: String,
    /// Verbose JS and fetcher logging.
    #[serde(default)]
    pub debug: bool,
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream fetcher settings.
    #[serde(default)]
    pub fetcher: FetcherConfig,
    /// Loader schedule and rules.
    #[serde(default)]
    pub loader: LoaderConfig,
    /// VM pool sizing.
    #[serde(default)]
    pub vm: VmPoolConfig,
    /// Renderer pipeline in dispatch order.
    #[serde(default)]
    pub renderers: Vec<RendererConfig>,
}

fn default_env() -> String {
    "production".to_string()
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SsrError> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).map_err(|e| SsrError::io(path.display().to_string(), e))?;
        toml::from_str(&contents).map_err(|e| {
            SsrError::Config(format!(
                "failed to parse configuration file {}: {e}",
                path.display()
            ))
        })
    }

    /// Loads configuration from a TOML file and applies environment
    /// overrides: any `DEBUG` value turns verbose logging on.
    pub fn from_file_and_env(path: impl AsRef<Path>) -> Result<Self, SsrError> {
        let mut config = Self::from_file(path)?;
        if env::var_os("DEBUG").is_some() {
            config.debug = true;
        }
        Ok(config)
    }

    /// Validates everything the renderer preparation step does not cover.
    pub fn validate(&self) -> Result<(), SsrError> {
        if self.env.is_empty() {
            return Err(SsrError::Config("env must not be empty".to_string()));
        }

        if self.server.tls {
            let (Some(cert), Some(key)) =
                (&self.server.tls_cert_file, &self.server.tls_key_file)
            else {
                return Err(SsrError::Config(
                    "server.tls requires tls_cert_file and tls_key_file".to_string(),
                ));
            };
            for path in [Some(cert), Some(key), self.server.tls_ca_file.as_ref()]
                .into_iter()
                .flatten()
            {
                if !path.is_file() {
                    return Err(SsrError::Config(format!(
                        "TLS file not found: {}",
                        path.display()
                    )));
                }
            }
        }

        for resource in &self.fetcher.resources {
            if resource.name.is_empty() || resource.url.is_empty() {
                return Err(SsrError::Config(
                    "fetcher resources need a name and a url".to_string(),
                ));
            }
        }
        let template_names: HashSet<&str> = self
            .fetcher
            .templates
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        let resource_names: HashSet<&str> = self
            .fetcher
            .resources
            .iter()
            .map(|r| r.name.as_str())
            .collect();

        for (idx, rule) in self.loader.rules.iter().enumerate() {
            if let Some(template) = rule.template_name() {
                if !template_names.contains(template) {
                    return Err(SsrError::Config(format!(
                        "loader rule {idx} references unknown template '{template}'"
                    )));
                }
            }
            let base = match rule {
                LoaderRule::Static { resource } => resource,
                LoaderRule::Single { resource, .. } => resource,
                LoaderRule::List { resource, .. } => resource,
            };
            if !resource_names.contains(base.as_str()) {
                return Err(SsrError::Config(format!(
                    "loader rule {idx} references unknown resource '{base}'"
                )));
            }
        }

        Ok(())
    }
}
