use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use screen_relay::config::{self, AppConfig};
use screen_relay::relay::LivenessMonitor;
use screen_relay::state::AppState;
use screen_relay::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Screen relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "screen-relay")]
#[command(version, about = "WebSocket relay between a screen-streaming device and its viewers", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS", env = "RELAY_BIND_ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT", env = "PORT")]
    port: Option<u16>,

    /// Seconds between heartbeat probes (overrides config file)
    #[arg(long, value_name = "SECS", env = "RELAY_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_format);

    tracing::info!("Starting screen-relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(args.config.as_deref()).await?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let bind_ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.web.bind_address))?;
    let addr = SocketAddr::new(bind_ip, config.web.port);

    let state = AppState::new(config);

    let monitor_shutdown = CancellationToken::new();
    let monitor = LivenessMonitor::new(state.router.clone(), &state.config.relay)
        .start(monitor_shutdown.clone());

    let app = web::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    let router = state.router.clone();
    let shutdown_signal = async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        monitor_shutdown.cancel();
        router.shutdown();
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
    {
        tracing::error!("HTTP server error: {}", e);
    }

    state.router.shutdown();
    if let Err(e) = monitor.await {
        tracing::warn!("Liveness monitor task failed: {}", e);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// CLI and environment values take precedence over the config file
fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(ref addr) = args.address {
        config.web.bind_address = addr.clone();
    }
    if let Some(port) = args.port {
        config.web.port = port;
    }
    if let Some(secs) = args.heartbeat_secs {
        config.relay.heartbeat_interval_secs = secs;
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, format: LogFormat) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "screen_relay=error,tower_http=error",
        LogLevel::Warn => "screen_relay=warn,tower_http=warn",
        LogLevel::Info => "screen_relay=info,tower_http=info",
        LogLevel::Verbose => "screen_relay=debug,tower_http=info",
        LogLevel::Debug => "screen_relay=debug,tower_http=debug",
        LogLevel::Trace => "screen_relay=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
}
