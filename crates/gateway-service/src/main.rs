use clap::Parser;
use gateway_config::GatewayConfig;
use gateway_core::{GatewayCore, InMemoryStore, LoggingDemandSignalSink, PersistenceStore};
use gateway_service::start_service;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// NexusX API-monetization gateway HTTP service.
#[derive(Parser)]
#[command(name = "gateway-service")]
#[command(about = "HTTP service for the NexusX API-monetization gateway")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = "nexusx.config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Port to listen on (overrides config).
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level_filter = match cli.log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("Invalid log level: {}", cli.log_level);
            std::process::exit(1);
        }
    };

    let mut config = if cli.config.exists() {
        match GatewayConfig::load_from_path(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load configuration: {e}");
                std::process::exit(1);
            }
        }
    } else {
        GatewayConfig::load().unwrap_or_default()
    };

    if let Some(port) = cli.port {
        config.service.port = port;
    }

    let stdout_layer = if config.logging.format == "json" {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().pretty().boxed()
    };

    // Keeping the guard alive for the process lifetime is what flushes the
    // non-blocking writer; dropping it early silently truncates the log file.
    let _file_guard = if config.logging.file_enabled {
        let file_path = config
            .logging
            .file_path
            .clone()
            .unwrap_or_else(|| "nexusx-gateway.log".to_string());
        let path = Path::new(&file_path);
        let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
        let directory = directory.unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "nexusx-gateway.log".to_string());
        let appender = tracing_appender::rolling::daily(directory, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(non_blocking)
            .boxed();

        tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::from_level(level_filter))
            .with(stdout_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::from_level(level_filter))
            .with(stdout_layer)
            .init();
        None
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("Starting NexusX gateway service");
    info!("Configuration loaded from: {}", cli.config.display());
    info!("Service will listen on port: {}", config.service.port);

    let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::new());
    let demand_sink = Arc::new(LoggingDemandSignalSink);
    let core = match GatewayCore::new(config, store, demand_sink) {
        Ok(core) => Arc::new(core),
        Err(e) => {
            error!("Failed to build gateway core: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = start_service(core).await {
        error!("Service failed: {e}");
        std::process::exit(1);
    }
}
