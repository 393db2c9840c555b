//! Rendezvous Alert Queue
//!
//! Single-producer/single-consumer handoff between the monitor and the
//! dispatcher. A send completes only after the receiver has taken the event,
//! so a stalled dispatcher stalls the monitor. Only the sender can close the
//! queue: it is not `Clone`, and dropping it (or calling [`AlertSender::close`])
//! is the one way to end the stream.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A reading classified as out of range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertEvent {
    pub value: f64,
}

impl AlertEvent {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

/// The receiving side is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Alert queue is closed")]
pub struct QueueClosed;

struct Handoff {
    event: AlertEvent,
    accepted: oneshot::Sender<()>,
}

/// Create a connected sender/receiver pair
pub fn alert_queue() -> (AlertSender, AlertReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (AlertSender { tx }, AlertReceiver { rx })
}

/// Writing half, owned by the monitor
#[derive(Debug)]
pub struct AlertSender {
    tx: mpsc::Sender<Handoff>,
}

impl AlertSender {
    /// Hand an event to the dispatcher and wait until it has been taken
    pub async fn send(&self, event: AlertEvent) -> Result<(), QueueClosed> {
        let (accepted, taken) = oneshot::channel();
        self.tx
            .send(Handoff { event, accepted })
            .await
            .map_err(|_| QueueClosed)?;
        taken.await.map_err(|_| QueueClosed)
    }

    /// Hand an event to the dispatcher unless `cancel` fires first.
    ///
    /// `Ok(true)` means the dispatcher took the event, `Ok(false)` that
    /// cancellation won and the event was withdrawn. An event taken in the
    /// same instant as cancellation counts as taken.
    pub async fn send_unless_cancelled(
        &self,
        event: AlertEvent,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueClosed> {
        let (accepted, mut taken) = oneshot::channel();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            sent = self.tx.send(Handoff { event, accepted }) => sent.map_err(|_| QueueClosed)?,
        }

        tokio::select! {
            biased;
            ack = &mut taken => ack.map(|()| true).map_err(|_| QueueClosed),
            _ = cancel.cancelled() => {
                // Withdraw the event; an ack that raced in is still honoured
                taken.close();
                Ok(taken.try_recv().is_ok())
            }
        }
    }

    /// Close the queue; the receiver drains what is left and then ends
    pub fn close(self) {}
}

/// Reading half, owned by the dispatcher
#[derive(Debug)]
pub struct AlertReceiver {
    rx: mpsc::Receiver<Handoff>,
}

impl AlertReceiver {
    /// Next event in FIFO order, or `None` once the queue is closed and drained
    pub async fn recv(&mut self) -> Option<AlertEvent> {
        loop {
            let handoff = self.rx.recv().await?;
            // Sender stopped waiting (cancelled mid-handoff): the event was never enqueued
            if handoff.accepted.send(()).is_ok() {
                return Some(handoff.event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = alert_queue();
        let producer = tokio::spawn(async move {
            for value in [1.0, 2.0, 3.0] {
                tx.send(AlertEvent::new(value)).await.unwrap();
            }
        });

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event.value);
        }
        producer.await.unwrap();
        assert_eq!(seen, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_send_waits_for_receiver() {
        let (tx, mut rx) = alert_queue();
        let send = tokio::spawn(async move {
            tx.send(AlertEvent::new(2048.0)).await.unwrap();
            tx
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!send.is_finished(), "send completed before the event was taken");

        assert_eq!(rx.recv().await, Some(AlertEvent::new(2048.0)));
        let tx = send.await.unwrap();
        tx.close();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_ends_receiver() {
        let (tx, mut rx) = alert_queue();
        let reader = tokio::spawn(async move { rx.recv().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.close();
        assert_eq!(reader.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_abandoned_handoff_is_skipped() {
        let (tx, mut rx) = alert_queue();
        let abandoned = tokio::time::timeout(Duration::from_millis(10), tx.send(AlertEvent::new(1.0))).await;
        assert!(abandoned.is_err());

        let producer = tokio::spawn(async move {
            tx.send(AlertEvent::new(2.0)).await.unwrap();
        });
        assert_eq!(rx.recv().await, Some(AlertEvent::new(2.0)));
        producer.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_taken_event_counts_even_if_cancelled_right_after() {
        let (tx, mut rx) = alert_queue();
        let cancel = CancellationToken::new();
        let sender = tokio::spawn({
            let cancel = cancel.clone();
            async move { tx.send_unless_cancelled(AlertEvent::new(7.0), &cancel).await }
        });

        assert_eq!(rx.recv().await, Some(AlertEvent::new(7.0)));
        cancel.cancel();
        assert_eq!(sender.await.unwrap(), Ok(true));
    }

    #[tokio::test]
    async fn test_cancel_before_take_withdraws_event() {
        let (tx, mut rx) = alert_queue();
        let cancel = CancellationToken::new();
        let sender = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let sent = tx.send_unless_cancelled(AlertEvent::new(7.0), &cancel).await;
                (sent, tx)
            }
        });

        tokio::task::yield_now().await;
        cancel.cancel();
        let (sent, tx) = sender.await.unwrap();
        assert_eq!(sent, Ok(false));

        tx.close();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_cancelled_send_never_enqueues() {
        let (tx, mut rx) = alert_queue();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(tx.send_unless_cancelled(AlertEvent::new(1.0), &cancel).await, Ok(false));
        tx.close();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_fails_without_receiver() {
        let (tx, rx) = alert_queue();
        drop(rx);
        assert_eq!(tx.send(AlertEvent::new(1.0)).await, Err(QueueClosed));
    }
}
