mod access;
mod config;
mod models;
mod proxy;
mod stats;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::access::AccessPolicy;
use crate::config::settings::{LoggingConfig, Settings};
use crate::proxy::connection::ConnectionTracker;
use crate::proxy::http_handler::HttpHandler;
use crate::proxy::server::ProxyServer;
use crate::stats::{StatsAggregator, StatsReporter};

const DEFAULT_CONFIG_PATH: &str = "config/tallyproxy.toml";

struct Cli {
    config_path: String,
    port: Option<u16>,
    show_version: bool,
}

/// Parse `--config <path>`, `--port <n>` and `--version`.
fn parse_args() -> anyhow::Result<Cli> {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = Cli {
        config_path: String::from(DEFAULT_CONFIG_PATH),
        port: None,
        show_version: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if let Some(path) = args.get(i + 1) {
                    cli.config_path = path.clone();
                }
                i += 2;
            }
            "--port" => {
                if let Some(port) = args.get(i + 1) {
                    let port = port
                        .parse::<u16>()
                        .with_context(|| format!("Invalid --port value: {}", port))?;
                    cli.port = Some(port);
                }
                i += 2;
            }
            "--version" => {
                cli.show_version = true;
                i += 1;
            }
            _ => i += 1,
        }
    }

    Ok(cli)
}

/// Initialise the `tracing` subscriber with stdout output and, when a log
/// file is configured, a non-blocking file writer. `RUST_LOG` overrides the
/// configured level.
fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true);

    let (file_layer, guard) = if logging.file.is_empty() {
        (None, None)
    } else {
        let path = Path::new(&logging.file);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let _ = std::fs::create_dir_all(dir);
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "tallyproxy.log".into());

        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}

fn log_security_summary(settings: &Settings, policy: &AccessPolicy) {
    let networks = policy.networks();
    if networks.allows_everyone() {
        warn!("allowed_networks is empty: the proxy accepts clients from ANY address");
    } else if networks.networks().is_empty() {
        warn!("No valid entry in allowed_networks: every proxy client will be denied");
    } else {
        info!("Allowed networks: {}", networks);
    }

    if settings.security.trust_forwarded_for {
        info!("Client address taken from X-Forwarded-For when present");
    }

    if policy.auth_enabled() {
        info!(
            users = policy.user_count(),
            realm = %settings.auth.realm,
            "Proxy authentication enabled"
        );
        if policy.user_count() == 0 {
            warn!("Authentication is enabled but no credentials are configured");
        }
    } else {
        info!("Proxy authentication disabled");
    }

    info!(
        "Stats host {} is always reachable; statistics at http://{}{}",
        settings.stats.host, settings.stats.host, settings.stats.path
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---------------------------------------------------------------
    // 1. Configuration
    // ---------------------------------------------------------------
    let cli = parse_args()?;
    if cli.show_version {
        println!("tallyproxy {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let (mut settings, read_error) = Settings::load(&cli.config_path)?;
    if let Some(port) = cli.port {
        settings.override_port(port)?;
    }

    // ---------------------------------------------------------------
    // 2. Logging
    // ---------------------------------------------------------------
    let _log_guard = init_tracing(&settings.logging);

    info!("Starting tallyproxy {}", env!("CARGO_PKG_VERSION"));
    match read_error {
        Some(err) => warn!(
            "Could not read config file {}: {}. Using default settings",
            cli.config_path, err
        ),
        None => info!("Config loaded from {}", cli.config_path),
    }

    let settings = Arc::new(settings);

    // ---------------------------------------------------------------
    // 3. Access control and statistics
    // ---------------------------------------------------------------
    let policy = Arc::new(AccessPolicy::new(&settings.security, &settings.auth));
    log_security_summary(&settings, &policy);

    let stats = Arc::new(StatsAggregator::new());
    let connections = Arc::new(ConnectionTracker::new());

    let reporter_handle = StatsReporter::new(&settings.stats, Arc::clone(&stats)).map(|reporter| {
        tokio::spawn(async move {
            reporter.run().await;
        })
    });

    // ---------------------------------------------------------------
    // 4. Proxy server
    // ---------------------------------------------------------------
    let handler = Arc::new(HttpHandler::new(
        Arc::clone(&settings),
        policy,
        stats,
        Arc::clone(&connections),
    ));
    let proxy_server = ProxyServer::new(Arc::clone(&settings), handler, connections);
    let listener = proxy_server.bind()?;

    info!(
        "Configure your browser to use http://{} as HTTP and HTTPS proxy",
        settings.server.bind
    );

    let proxy_handle = tokio::spawn(async move {
        proxy_server.serve(listener).await;
    });

    info!("tallyproxy is running. Press Ctrl+C to shut down.");

    // ---------------------------------------------------------------
    // 5. Wait for shutdown signal
    // ---------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Shutting down tallyproxy...");

    proxy_handle.abort();
    if let Some(handle) = reporter_handle {
        handle.abort();
    }

    info!("tallyproxy shut down");
    Ok(())
}
