//! tallyd — the tally daemon.
//!
//! Single binary that assembles:
//! - Configuration (tally.toml + environment + flags)
//! - Storage backend (memory, redb file, or Redis)
//! - Metric registry and recording facade
//! - HTTP API with request instrumentation
//!
//! # Usage
//!
//! ```text
//! tallyd serve --config /etc/tally/tally.toml --port 9090
//! tallyd config --config /etc/tally/tally.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tally_core::TallyConfig;
use tally_core::config::{EnvWarning, LogFormat, LoggingConfig};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info,tallyd=debug,tally=debug";

#[derive(Parser)]
#[command(name = "tallyd", about = "tally metrics daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve /metrics and the instrumented API.
    Serve {
        /// Path to tally.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address, overrides `server.listen`.
        #[arg(long)]
        listen: Option<String>,

        /// Port to listen on, overrides the port of the listen address.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the resolved configuration as TOML, with secrets masked.
    Config {
        /// Path to tally.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            port,
        } => {
            let (config, warnings) = load_config(config.as_deref())?;
            init_tracing(&config.logging, &config.service.name);
            for warning in &warnings {
                warn!(var = warning.var, value = %warning.value, "{}", warning.action);
            }
            let addr = resolve_listen(listen.as_deref().unwrap_or(&config.server.listen), port)?;
            run_server(config, addr).await
        }
        Command::Config { config } => {
            let (config, warnings) = load_config(config.as_deref())?;
            for warning in &warnings {
                eprintln!("warning: {warning}");
            }
            print!("{}", render_config(&config)?);
            Ok(())
        }
    }
}

/// File (or defaults) plus environment overrides, with the overrides that
/// could not be applied. Logging is not up yet, so the caller reports them.
fn load_config(path: Option<&Path>) -> anyhow::Result<(TallyConfig, Vec<EnvWarning>)> {
    load_config_with(path, |key| std::env::var(key).ok())
}

fn load_config_with(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<(TallyConfig, Vec<EnvWarning>)> {
    let mut config = match path {
        Some(path) => TallyConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TallyConfig::default(),
    };
    let warnings = config.apply_env_with(lookup);
    Ok((config, warnings))
}

fn render_config(config: &TallyConfig) -> anyhow::Result<String> {
    config.redacted().to_toml_string()
}

/// `RUST_LOG`, then the configured filter, then the built-in default.
fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.filter.as_deref().unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Text or JSON output, plus OpenTelemetry span ids for trace propagation.
fn init_tracing(logging: &LoggingConfig, service: &str) {
    let (text, json) = match logging.format {
        LogFormat::Text => (Some(fmt::layer()), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_current_span(true))),
    };
    tracing_subscriber::registry()
        .with(env_filter(logging))
        .with(text)
        .with(json)
        .with(tally_api::trace::tracing_layer(service.to_string()))
        .init();
}

fn resolve_listen(listen: &str, port: Option<u16>) -> anyhow::Result<SocketAddr> {
    let mut addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen:?}"))?;
    if let Some(port) = port {
        addr.set_port(port);
    }
    Ok(addr)
}

async fn run_server(config: TallyConfig, addr: SocketAddr) -> anyhow::Result<()> {
    info!(
        service = %config.service.name,
        version = %config.service.version,
        environment = %config.service.environment,
        "tally daemon starting"
    );

    // ── Initialize subsystems ──────────────────────────────────

    let backend = tally_store::select_backend(&config.metrics, &config.redis);
    info!(storage = backend.kind().as_str(), "storage backend ready");

    let registry = Arc::new(tally_metrics::Registry::new(backend));
    let metrics = Arc::new(tally_metrics::Metrics::new(registry, config.metrics.clone()));
    info!(namespace = metrics.namespace(), "metrics registry initialized");

    // ── Start API server ───────────────────────────────────────

    let state = tally_api::ApiState::new(metrics, config.service.clone());
    let router = tally_api::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("tally daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
