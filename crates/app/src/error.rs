//! Pipeline Error Types

use alerting::DeliveryError;
use thiserror::Error;
use threshold_monitor::MonitorError;

/// Fatal pipeline errors; the process exits non-zero on any of them
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Delivery platform rejected the credential or could not be reached
    #[error("Delivery authentication failed: {0}")]
    Authentication(#[source] DeliveryError),

    /// Source monitor stopped on a fatal condition
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// Notification stream ended without a shutdown request
    #[error("Notification stream ended unexpectedly")]
    StreamEnded,

    /// Monitor task panicked or was aborted
    #[error("Monitor task failed: {0}")]
    Task(String),
}
