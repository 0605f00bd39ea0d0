//! # Vitrine — SSR render server binary
//!
//! Loads the TOML configuration, assembles the shared components and runs
//! the listener plus the background loader.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use vitrine::buffer::BufferPool;
use vitrine::cache::Cache;
use vitrine::config::Config;
use vitrine::fetcher::Fetcher;
use vitrine::loader::Loader;
use vitrine::renderer::{prepare_renderers, PreparedRenderer, Services};
use vitrine::server;
use vitrine::vm::VmPool;

/// Vitrine SSR server
#[derive(Parser, Debug)]
#[command(name = "vitrine")]
#[command(author, version, about = "Server-side rendering HTTP server", long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long, default_value = "vitrine.toml", env = "VITRINE_CONFIG")]
    config: PathBuf,

    /// Override the bind address
    #[arg(short = 'H', long, env = "HOST")]
    host: Option<String>,

    /// Override the bind port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

struct Assembled {
    prepared: Arc<Vec<PreparedRenderer>>,
    services: Services,
    loader: Arc<Loader>,
}

/// Validates the configuration and builds every shared component.
fn assemble(config: &Config) -> anyhow::Result<Assembled> {
    config.validate().context("invalid configuration")?;
    let prepared = Arc::new(
        prepare_renderers(&config.renderers).context("invalid renderer pipeline")?,
    );

    let payloads = Arc::new(Cache::new());
    let fetcher = Arc::new(
        Fetcher::new(&config.fetcher, Arc::clone(&payloads))
            .context("failed to initialize fetcher")?,
    );
    let services = Services {
        fetcher: Arc::clone(&fetcher),
        pages: Arc::new(Cache::new()),
        buffers: Arc::new(BufferPool::default()),
        vm_pool: VmPool::new(&config.vm),
        env: config.env.clone(),
    };
    let loader = Arc::new(Loader::new(&config.loader, fetcher));

    Ok(Assembled {
        prepared,
        services,
        loader,
    })
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "info,vitrine=debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Entry point for the Actix Web server
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    let mut config = match Config::from_file_and_env(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("❌ Failed to load {}: {err}", cli.config.display());
            std::process::exit(1);
        }
    };
    if let Some(host) = cli.host {
        config.server.listen = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_tracing(config.debug);

    let assembled = match assemble(&config) {
        Ok(assembled) => assembled,
        Err(err) => {
            eprintln!("❌ {err:#}");
            std::process::exit(1);
        }
    };

    if cli.check {
        println!("✅ Configuration OK: {}", cli.config.display());
        return Ok(());
    }

    let loader_handle = assembled.loader.start();

    println!("🧊 Vitrine {}", server::VERSION);
    println!(
        "   Listening on {}://{}:{}",
        if config.server.tls { "https" } else { "http" },
        config.server.listen,
        config.server.port
    );
    println!("   Environment: {}", config.env);
    println!("   Renderers:   {}", config.renderers.len());

    let result = server::run(&config, assembled.prepared, assembled.services).await;
    loader_handle.stop().await;

    if let Err(err) = result {
        eprintln!("❌ Server failed: {err}");
        std::process::exit(1);
    }
    Ok(())
}
