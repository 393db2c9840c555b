//! Threshold Monitor
//!
//! Watches one process variable through a subscription source, classifies
//! every reading against a [`BoundPair`] and hands out-of-range readings to
//! the alert queue.

mod bounds;
mod error;
mod monitor;
mod queue;

pub use bounds::{BoundPair, DEFAULT_HIGH, DEFAULT_LOW};
pub use error::MonitorError;
pub use monitor::{MonitorReport, SourceMonitor};
pub use queue::{alert_queue, AlertEvent, AlertReceiver, AlertSender, QueueClosed};
