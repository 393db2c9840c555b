//! Threshold Alert Service
//!
//! Wires the source monitor and the alert dispatcher together through the
//! rendezvous alert queue and runs them until shutdown.

mod error;
pub mod settings;

pub use error::PipelineError;
pub use settings::{AppConfig, ConfigError, LogFormat, SinkKind, SourceKind};

use alerting::{
    AlertDispatcher, DeliveryError, DeliverySink, Destination, DispatchReport, MqttSink,
    TelegramSink,
};
use opc_source::{SimulatedSource, SubscriptionSource, UaTcpSource};
use threshold_monitor::{alert_queue, MonitorReport, SourceMonitor};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Counters from both pipeline stages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub monitor: MonitorReport,
    pub dispatch: DispatchReport,
}

/// Initialize logging. `RUST_LOG` overrides the default `info` level.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the monitor and the dispatcher concurrently until the monitor stops
/// and the dispatcher has drained the queue.
///
/// The monitor runs on its own task; the dispatcher runs on the caller's.
/// A fatal monitor error closes the queue, so the dispatcher always ends.
pub async fn run_pipeline<S, D>(
    monitor: SourceMonitor,
    source: S,
    dispatcher: AlertDispatcher<D>,
    cancel: CancellationToken,
) -> Result<PipelineReport, PipelineError>
where
    S: SubscriptionSource + 'static,
    D: DeliverySink,
{
    let (alerts_tx, alerts_rx) = alert_queue();
    let monitor_task = tokio::spawn(monitor.run(source, alerts_tx, cancel));

    let dispatch = dispatcher.run(alerts_rx).await;
    let monitor = monitor_task
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))??;

    Ok(PipelineReport { monitor, dispatch })
}

/// Authenticate against the configured delivery platform
pub async fn build_sink(config: &AppConfig) -> Result<Box<dyn DeliverySink>, DeliveryError> {
    match config.sink {
        SinkKind::Telegram => Ok(Box::new(
            TelegramSink::authenticate(&config.telegram_api_url, &config.token).await?,
        )),
        SinkKind::Mqtt => Ok(Box::new(
            MqttSink::connect(config.mqtt.clone(), &config.token).await?,
        )),
    }
}

/// Run the service until `cancel` fires
pub async fn run(config: AppConfig, cancel: CancellationToken) -> Result<PipelineReport, PipelineError> {
    let sink = build_sink(&config)
        .await
        .map_err(PipelineError::Authentication)?;
    let dispatcher = AlertDispatcher::new(sink, Destination::channel(&config.channel), config.bounds);
    let monitor = SourceMonitor::new(&config.endpoint, &config.node_id, config.bounds);

    let report = match config.source {
        SourceKind::OpcUa => run_pipeline(monitor, UaTcpSource::new(), dispatcher, cancel.clone()).await?,
        SourceKind::Simulated => {
            warn!(
                endpoint = %config.endpoint,
                "OPC_SOURCE=simulated: readings come from an in-process random feed, not the endpoint"
            );
            run_pipeline(monitor, SimulatedSource::random(), dispatcher, cancel.clone()).await?
        }
    };
    if !cancel.is_cancelled() {
        return Err(PipelineError::StreamEnded);
    }
    Ok(report)
}

/// Wait for Ctrl-C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl-C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
