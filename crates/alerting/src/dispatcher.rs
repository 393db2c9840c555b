//! Alert Dispatcher
//!
//! Drains the alert queue and sends one message per event. Delivery is best
//! effort: a failed send is logged and the next event is attempted.

use crate::message::format_alert;
use crate::sink::{DeliverySink, Destination};
use metrics::counter;
use threshold_monitor::{AlertReceiver, BoundPair};
use tracing::{error, info};

/// Outcome of a dispatcher run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages accepted by the sink
    pub sent: usize,
    /// Messages the sink failed to deliver
    pub failed: usize,
}

/// Sends alert messages for every queued event
pub struct AlertDispatcher<S> {
    sink: S,
    destination: Destination,
    bounds: BoundPair,
}

impl<S: DeliverySink> AlertDispatcher<S> {
    /// Create a dispatcher sending to `destination` through `sink`
    pub fn new(sink: S, destination: Destination, bounds: BoundPair) -> Self {
        Self {
            sink,
            destination,
            bounds,
        }
    }

    /// Run until the queue is closed and drained
    pub async fn run(&self, mut alerts: AlertReceiver) -> DispatchReport {
        info!(destination = %self.destination, "Alert dispatcher started");
        let mut report = DispatchReport::default();

        while let Some(event) = alerts.recv().await {
            let text = format_alert(&self.bounds, event.value);
            match self.sink.send(&self.destination, &text).await {
                Ok(()) => {
                    report.sent += 1;
                    counter!("dispatcher_alerts_sent_total").increment(1);
                }
                Err(e) => {
                    report.failed += 1;
                    counter!("dispatcher_send_failures_total").increment(1);
                    error!(value = event.value, error = %e, "Cannot send message");
                }
            }
        }

        info!(sent = report.sent, failed = report.failed, "Alert queue closed, dispatcher stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use threshold_monitor::{alert_queue, AlertEvent};

    /// Records messages; fails the sends whose index is listed
    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        fail_on: Vec<usize>,
        attempts: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn send(&self, destination: &Destination, text: &str) -> Result<(), DeliveryError> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts += 1;
                *attempts - 1
            };
            if self.fail_on.contains(&attempt) {
                return Err(DeliveryError::Api {
                    code: 400,
                    description: "chat not found".to_string(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((destination.address(), text.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sends_formatted_alerts_in_order() {
        let sink = RecordingSink::default();
        let dispatcher = AlertDispatcher::new(
            sink.clone(),
            Destination::channel("plant_alerts"),
            BoundPair::new(0.0, 100.0),
        );
        let (tx, rx) = alert_queue();

        let producer = tokio::spawn(async move {
            tx.send(AlertEvent::new(57.345)).await.unwrap();
            tx.send(AlertEvent::new(-3.0)).await.unwrap();
        });
        let report = dispatcher.run(rx).await;
        producer.await.unwrap();

        assert_eq!(report, DispatchReport { sent: 2, failed: 0 });
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0].0, "@plant_alerts");
        assert_eq!(sent[0].1, "Range between 0 and 100 expected.\nValue of 57.35 detected.");
        assert_eq!(sent[1].1, "Range between 0 and 100 expected.\nValue of -3.00 detected.");
    }

    #[tokio::test]
    async fn test_failed_send_does_not_stop_dispatch() {
        let sink = RecordingSink {
            fail_on: vec![0],
            ..Default::default()
        };
        let dispatcher =
            AlertDispatcher::new(sink.clone(), Destination::channel("ops"), BoundPair::default());
        let (tx, rx) = alert_queue();

        let producer = tokio::spawn(async move {
            for value in [2000.0, 3000.0] {
                tx.send(AlertEvent::new(value)).await.unwrap();
            }
        });
        let report = dispatcher.run(rx).await;
        producer.await.unwrap();

        assert_eq!(report, DispatchReport { sent: 1, failed: 1 });
        assert_eq!(*sink.attempts.lock().unwrap(), 2);
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("3000.00"));
    }

    #[tokio::test]
    async fn test_stops_when_queue_closed() {
        let dispatcher = AlertDispatcher::new(
            RecordingSink::default(),
            Destination::channel("ops"),
            BoundPair::default(),
        );
        let (tx, rx) = alert_queue();
        tx.close();
        assert_eq!(dispatcher.run(rx).await, DispatchReport::default());
    }
}
