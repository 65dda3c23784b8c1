use std::{path::PathBuf, process, sync::Arc};

use clap::Parser;
use nodewatch::{
    config::{server::parse_bind_address, Config},
    core::{
        metrics::Registry,
        plugins::{manager::log_plugins_table, PluginManager, PluginTable},
        server::{Exporter, MetricsServer},
    },
    logger::LoggerManager,
    print_error,
};
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[clap(version, about = "Node metrics agent with a Prometheus text endpoint")]
struct Args {
    /// JSON configuration file.
    #[clap(long, env = "NODEWATCH_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Listen address; an empty host binds every interface.
    #[clap(long, default_value = ":9090")]
    bind: String,

    /// Overrides `logger.level` from the configuration file.
    #[clap(long)]
    log_level: Option<String>,
}

fn fatal(message: impl std::fmt::Display) -> ! {
    print_error!("{}", message);
    process::exit(1);
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut interrupt, mut terminate) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        return std::future::pending().await;
    }
    "Ctrl+C"
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut cfg = Config::load(&args.config).unwrap_or_else(|e| fatal(e));
    if let Some(level) = args.log_level {
        cfg.logger.level = level;
    }
    let addr = parse_bind_address(&args.bind).unwrap_or_else(|e| fatal(e));

    let mut logger_manager = LoggerManager::new(cfg.logger.clone())
        .unwrap_or_else(|e| fatal(format!("Failed to setup Log Manager: {}", e)));
    logger_manager
        .init()
        .unwrap_or_else(|e| fatal(format!("Failed to init Log Manager: {}", e)));
    info!("Starting nodewatch version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.server);

    let table = PluginTable::builtin();
    log_plugins_table(&cfg.plugins, &table);

    let mut manager = PluginManager::load(&cfg.plugins, &table, Arc::new(Registry::new()));
    let started = manager.start_updates();
    info!(
        "{} plugin(s) active, {} background task group(s) started",
        manager.active().len(),
        started
    );

    let exporter = Arc::new(Exporter::new(manager, cfg.server.compression_level));
    let server = MetricsServer::bind(addr, exporter, cfg.server.clone())
        .await
        .unwrap_or_else(|e| {
            error!("{}", e);
            process::exit(1);
        });

    tokio::select! {
        _ = server.run() => {
            error!("Metrics server unexpectedly finished");
            process::exit(1);
        }
        signal = shutdown_signal() => {
            info!("Received {}, shutting down", signal);
        }
    }
}
