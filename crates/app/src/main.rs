//! Threshold Alert - Main Entry Point

use app::{init_logging, run, settings, shutdown_signal, AppConfig, LogFormat};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let settings = match settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(LogFormat::from_settings(&settings));

    info!("=== Threshold Alert v{} ===", env!("CARGO_PKG_VERSION"));

    let config = match AppConfig::from_settings(&settings) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        endpoint = %config.endpoint,
        node = %config.node_id,
        bounds = %config.bounds,
        source = ?config.source,
        sink = ?config.sink,
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        shutdown.cancel();
    });

    match run(config, cancel).await {
        Ok(report) => {
            info!(
                alerts = report.monitor.alerts,
                sent = report.dispatch.sent,
                failed = report.dispatch.failed,
                "Graceful shutdown complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}
