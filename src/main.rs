//! Streamhub Server
//!
//! Run with: cargo run -- --config config.toml
//!
//! # Configuration
//!
//! Read from `--config`, else the first of
//! `~/.config/streamhub/config.toml`, `/etc/streamhub/config.toml`,
//! `./config.toml`. Environment variables override the file:
//! - `STREAMHUB_HOST`, `STREAMHUB_PORT`: bind address
//! - `CORS_ALLOWED_ORIGINS`: comma-separated origin allow-list
//! - `STREAMHUB_ALLOW_LOCALHOST`: admit any localhost origin
//! - `STREAMHUB_DATABASE`: SQLite database backing the metrics stream
//! - `STREAMHUB_LOG_LEVEL`, `STREAMHUB_LOG_FORMAT`: logging (`pretty` or `json`)
//! - `RUST_LOG`: takes precedence over the configured level

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use streamhub::api::{serve, AppState};
use streamhub::auth::StaticTokenResolver;
use streamhub::config::{generate_default_config, Config, LoggingConfig};
use streamhub::store::{MetricsSource, NullMetricsSource, SqliteMetricsSource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "streamhub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time event hub for WebSocket clients")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a default config file and exit
    #[arg(long)]
    print_config: bool,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let (mut config, source) = match &args.config {
        Some(path) => {
            let config = Config::load_with_env(path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            (config, Some(path.clone()))
        }
        None => Config::load_default().context("loading config")?,
    };

    // CLI overrides
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_tracing(&config.logging);

    tracing::info!("Starting Streamhub v{}", env!("CARGO_PKG_VERSION"));
    match &source {
        Some(path) => tracing::info!("Loaded config from {:?}", path),
        None => tracing::info!("Using default config with environment overrides"),
    }

    let metrics = open_metrics_source(config.store.database_path.as_deref())?;

    let identity = StaticTokenResolver::new(&config.auth.tokens);
    if identity.is_empty() {
        tracing::warn!("No auth tokens configured; every upgrade will be refused");
    } else {
        tracing::info!("Loaded {} auth tokens", identity.len());
    }

    let origins = config.websocket.origin_policy();
    tracing::info!(
        "Allowed origins: {:?} (localhost: {})",
        origins.allowed_origins(),
        config.websocket.allow_localhost
    );

    let state = AppState::new(config, Arc::new(identity), metrics);
    serve(state).await?;

    Ok(())
}

/// Install the global subscriber; `RUST_LOG` wins over the configured level
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("streamhub={},tower_http=info", logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn open_metrics_source(path: Option<&str>) -> anyhow::Result<Arc<dyn MetricsSource>> {
    match path {
        Some(path) => {
            let source = SqliteMetricsSource::open(Path::new(path))
                .with_context(|| format!("opening database {}", path))?;
            tracing::info!("Metrics backed by {:?}", source.path());
            Ok(Arc::new(source))
        }
        None => {
            tracing::info!("No database configured; metrics stream reports zeros");
            Ok(Arc::new(NullMetricsSource))
        }
    }
}
