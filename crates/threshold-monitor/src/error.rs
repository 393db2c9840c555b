//! Monitor Error Types

use opc_source::{NodeIdError, SourceError, StatusCode};
use thiserror::Error;

/// Fatal conditions that stop the monitor
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Session could not be established
    #[error("Cannot connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: SourceError,
    },

    /// Subscription could not be created
    #[error("Cannot create subscription: {0}")]
    Subscribe(#[source] SourceError),

    /// Configured variable id is malformed
    #[error("Invalid node id {raw:?}: {source}")]
    InvalidNodeId {
        raw: String,
        #[source]
        source: NodeIdError,
    },

    /// Monitored item request failed outright
    #[error("Cannot monitor {node}: {source}")]
    MonitorRequest {
        node: String,
        #[source]
        source: SourceError,
    },

    /// Source acknowledged the monitored item with a bad status
    #[error("Monitoring {node} rejected with {status}")]
    MonitorRejected { node: String, status: StatusCode },

    /// Notification loop could not be started
    #[error("Cannot start notification delivery: {0}")]
    Start(#[source] SourceError),

    /// Alert queue reader disappeared while the monitor was running
    #[error("Alert dispatcher is gone")]
    DispatcherGone,
}
