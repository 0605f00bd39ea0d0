//! HTTP listener and request dispatch
//!
//! Every request gets a correlation ID, walks the renderer chain and leaves
//! with `Server` and `X-Correlation-ID` response headers plus an access log
//! line. Renderer chains are built once per worker thread; the shared
//! services behind them are process-wide.

use crate::config::{Config, ServerConfig};
use crate::error::SsrError;
use crate::renderer::{build_chain, PreparedRenderer, RendererRef, RequestContext, Services};
use crate::vm::ServerInfo;
use actix_web::http::header::{HeaderName, HeaderValue, SERVER};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Product name reported in the `Server` header.
pub const PRODUCT: &str = "vitrine";
/// Product version reported in the `Server` header and to bundles.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Access log sink: a file when configured, the process log otherwise.
pub struct AccessLog {
    file: Option<Mutex<File>>,
}

impl AccessLog {
    /// Opens the sink, creating or appending to the configured file.
    pub fn new(path: Option<&Path>) -> Result<Self, SsrError> {
        let file = match path {
            Some(path) => Some(Mutex::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| SsrError::io(path.display().to_string(), e))?,
            )),
            None => None,
        };
        Ok(Self { file })
    }

    fn record(&self, line: &str) {
        match &self.file {
            Some(file) => {
                let mut file = file.lock();
                if let Err(err) = writeln!(file, "{line}") {
                    tracing::warn!(target: "vitrine::server", error = %err, "access log write failed");
                }
            }
            None => tracing::info!(target: "vitrine::access", "{line}"),
        }
    }
}

/// Per-worker dispatch state: the chain head plus everything the access
/// path needs.
pub struct AppState {
    chain: RendererRef,
    info: ServerInfo,
    access: Option<Arc<AccessLog>>,
}

/// Entry point for every request: wraps it in a context, runs the chain,
/// decorates and logs the response.
pub async fn dispatch(request: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.path().to_string();
    let proto = format!("{:?}", request.version());
    let remote = request
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "-".to_string());

    let mut ctx = RequestContext::new(request);
    let correlation_id = ctx.correlation_id().to_string();
    let mut response = state.chain.handle(&mut ctx, &state.info).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("{PRODUCT}/{VERSION}")) {
        headers.insert(SERVER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        headers.insert(HeaderName::from_static("x-correlation-id"), value);
    }

    if let Some(access) = &state.access {
        let elapsed = started.elapsed();
        access.record(&format!(
            "{remote} \"{method} {path} {proto}\" {} {}ms {correlation_id}",
            response.status().as_u16(),
            elapsed.as_millis(),
        ));
    }
    response
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, SsrError> {
    let file = File::open(path).map_err(|e| SsrError::io(path.display().to_string(), e))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SsrError::Config(format!("invalid certificate file {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, SsrError> {
    let file = File::open(path).map_err(|e| SsrError::io(path.display().to_string(), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| SsrError::Config(format!("invalid key file {}: {e}", path.display())))?
        .ok_or_else(|| {
            SsrError::Config(format!("no private key found in {}", path.display()))
        })
}

/// Builds the rustls listener configuration, with client certificate
/// verification when a CA file is configured.
pub fn build_tls_config(config: &ServerConfig) -> Result<rustls::ServerConfig, SsrError> {
    let (Some(cert_path), Some(key_path)) = (&config.tls_cert_file, &config.tls_key_file) else {
        return Err(SsrError::Config(
            "TLS requires tls_cert_file and tls_key_file".to_string(),
        ));
    };
    let certs = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let builder = match &config.tls_ca_file {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certificates(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| SsrError::Config(format!("invalid client CA: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| SsrError::Config(format!("client verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    builder
        .with_single_cert(certs, key)
        .map_err(|e| SsrError::Config(format!("invalid certificate/key pair: {e}")))
}

/// Runs the listener until shutdown. The loader is expected to be started
/// (and stopped) by the caller.
pub async fn run(
    config: &Config,
    prepared: Arc<Vec<PreparedRenderer>>,
    services: Services,
) -> Result<(), SsrError> {
    let info = ServerInfo {
        addr: config.server.listen.clone(),
        port: config.server.port,
        version: VERSION.to_string(),
    };
    let access = if config.server.access_log {
        Some(Arc::new(AccessLog::new(
            config.server.access_log_file.as_deref(),
        )?))
    } else {
        None
    };

    let bind_addr = (config.server.listen.clone(), config.server.port);
    let factory = {
        let info = info.clone();
        move || {
            let chain = build_chain(&prepared, &services);
            App::new()
                .app_data(web::Data::new(AppState {
                    chain,
                    info: info.clone(),
                    access: access.clone(),
                }))
                .default_service(web::to(dispatch))
        }
    };

    let server = HttpServer::new(factory);
    let server = if config.server.tls {
        let tls = build_tls_config(&config.server)?;
        server
            .bind_rustls_0_23(bind_addr, tls)
            .map_err(|e| SsrError::Config(format!("failed to bind TLS listener: {e}")))?
    } else {
        server
            .bind(bind_addr)
            .map_err(|e| SsrError::Config(format!("failed to bind listener: {e}")))?
    };

    tracing::info!(
        target: "vitrine::server",
        addr = %config.server.listen,
        port = config.server.port,
        tls = config.server.tls,
        "listening"
    );
    server
        .run()
        .await
        .map_err(|e| SsrError::Config(format!("server error: {e}")))
}
