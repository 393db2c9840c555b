//! Source Monitor
//!
//! Opens a session, subscribes to a single variable and classifies every
//! data change against the configured [`BoundPair`]. Out-of-range readings
//! are handed to the alert queue one at a time.

use crate::bounds::BoundPair;
use crate::error::MonitorError;
use crate::queue::{AlertEvent, AlertSender};
use metrics::counter;
use opc_source::{
    AttributeId, MonitoredItemCreateRequest, NodeId, NotificationPayload, PublishNotification,
    Session, StatusCode, Subscription, SubscriptionParameters, SubscriptionSource,
    TimestampsToReturn,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the channel between the subscription feed and the classifier
const NOTIFICATION_BUFFER: usize = 16;

/// Client handle of the single monitored item
const CLIENT_HANDLE: u32 = 1;

/// Counters collected over one monitor run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Notifications taken from the feed
    pub notifications: usize,
    /// Numeric readings classified
    pub readings: usize,
    /// Alerts accepted by the dispatcher
    pub alerts: usize,
    /// Notifications dropped because they carried a delivery error
    pub notification_errors: usize,
    /// Payloads or values that were not numeric data changes
    pub unexpected_payloads: usize,
}

/// Watches one variable and raises alerts for out-of-range readings
#[derive(Debug, Clone)]
pub struct SourceMonitor {
    endpoint: String,
    node_id: String,
    bounds: BoundPair,
    params: SubscriptionParameters,
}

impl SourceMonitor {
    /// Create a monitor for `node_id` on `endpoint`
    pub fn new(endpoint: impl Into<String>, node_id: impl Into<String>, bounds: BoundPair) -> Self {
        Self {
            endpoint: endpoint.into(),
            node_id: node_id.into(),
            bounds,
            params: SubscriptionParameters::default(),
        }
    }

    /// Override the subscription parameters
    pub fn with_parameters(mut self, params: SubscriptionParameters) -> Self {
        self.params = params;
        self
    }

    /// Run until `cancel` fires, the notification stream ends, or a fatal
    /// error occurs.
    ///
    /// On the way out the subscription is released, then the session is
    /// closed, then the alert queue is closed. Transient per-notification
    /// problems are logged and skipped.
    pub async fn run<S: SubscriptionSource>(
        self,
        source: S,
        alerts: AlertSender,
        cancel: CancellationToken,
    ) -> Result<MonitorReport, MonitorError> {
        let mut session = source
            .connect(&self.endpoint)
            .await
            .map_err(|err| MonitorError::Connect {
                endpoint: self.endpoint.clone(),
                source: err,
            })?;
        info!(endpoint = %self.endpoint, "Connected to data source");

        let result = self.watch(&mut session, &alerts, &cancel).await;

        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close session");
        }
        debug!("Session closed");
        alerts.close();

        result
    }

    async fn watch<T: Session>(
        &self,
        session: &mut T,
        alerts: &AlertSender,
        cancel: &CancellationToken,
    ) -> Result<MonitorReport, MonitorError> {
        let (notify_tx, mut notify_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let mut subscription = session
            .subscribe(self.params.clone(), notify_tx)
            .await
            .map_err(MonitorError::Subscribe)?;
        info!(subscription_id = subscription.id(), "Created subscription");

        let result = match self.register(&mut subscription).await {
            Ok(()) => self.classify_loop(&mut notify_rx, alerts, cancel).await,
            Err(e) => Err(e),
        };

        if let Err(e) = subscription.cancel().await {
            warn!(error = %e, "Failed to cancel subscription");
        }
        result
    }

    /// Resolve the node id, register the monitored item and start delivery
    async fn register<U: Subscription>(&self, subscription: &mut U) -> Result<(), MonitorError> {
        let node: NodeId = self
            .node_id
            .parse()
            .map_err(|source| MonitorError::InvalidNodeId {
                raw: self.node_id.clone(),
                source,
            })?;

        let request =
            MonitoredItemCreateRequest::with_defaults(node.clone(), AttributeId::Value, CLIENT_HANDLE);
        let results = subscription
            .monitor(TimestampsToReturn::Both, vec![request])
            .await
            .map_err(|source| MonitorError::MonitorRequest {
                node: node.to_string(),
                source,
            })?;

        let status = results
            .first()
            .map(|result| result.status)
            .unwrap_or(StatusCode::BAD_NOTHING_TO_DO);
        if !status.is_good() {
            return Err(MonitorError::MonitorRejected {
                node: node.to_string(),
                status,
            });
        }

        subscription.start().map_err(MonitorError::Start)?;
        info!(node = %node, bounds = %self.bounds, "Monitoring value changes");
        Ok(())
    }

    async fn classify_loop(
        &self,
        notify_rx: &mut mpsc::Receiver<PublishNotification>,
        alerts: &AlertSender,
        cancel: &CancellationToken,
    ) -> Result<MonitorReport, MonitorError> {
        let mut report = MonitorReport::default();

        loop {
            let notification = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancellation requested, stopping monitor");
                    break;
                }
                received = notify_rx.recv() => match received {
                    Some(notification) => notification,
                    None => {
                        info!("Notification stream ended");
                        break;
                    }
                },
            };
            report.notifications += 1;
            counter!("monitor_notifications_total").increment(1);

            for event in self.classify(notification, &mut report) {
                let taken = alerts
                    .send_unless_cancelled(event, cancel)
                    .await
                    .map_err(|_| MonitorError::DispatcherGone)?;
                if !taken {
                    info!(value = event.value, "Cancellation requested while handing off alert");
                    return Ok(report);
                }
                report.alerts += 1;
                counter!("monitor_alerts_raised_total").increment(1);
                warn!(value = event.value, bounds = %self.bounds, "Limits exceeded");
            }
        }

        Ok(report)
    }

    /// Classify every item of one notification; yields the out-of-range readings
    fn classify(&self, notification: PublishNotification, report: &mut MonitorReport) -> Vec<AlertEvent> {
        if let Some(error) = notification.error {
            report.notification_errors += 1;
            warn!(error = %error, "Monitor error");
            return Vec::new();
        }

        let batch = match notification.payload {
            NotificationPayload::DataChange(batch) => batch,
            NotificationPayload::Unrecognized { type_name } => {
                report.unexpected_payloads += 1;
                warn!(payload = %type_name, "Unknown publish result");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for item in batch.monitored_items {
            match item.value.value.as_numeric() {
                Ok(value) => {
                    report.readings += 1;
                    if self.bounds.is_out_of_range(value) {
                        events.push(AlertEvent::new(value));
                    } else {
                        debug!(value, "Reading within limits");
                    }
                }
                Err(e) => {
                    report.unexpected_payloads += 1;
                    warn!(client_handle = item.client_handle, error = %e, "Unexpected payload type");
                }
            }
        }
        events
    }
}
