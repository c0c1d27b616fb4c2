//! In-process and composite notification channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{ChannelError, NotificationChannel};
use crate::domain::EventRecord;

/// Events buffered for the dispatcher before `send` waits for room
pub const DEFAULT_CAPACITY: usize = 256;

/// An event handed to the in-process consumer, pending acknowledgement
#[derive(Debug)]
pub struct Delivery {
    pub event: EventRecord,
    ack: oneshot::Sender<()>,
}

impl Delivery {
    /// Confirm the event was handled; the sender then counts it delivered
    pub fn ack(self) {
        let _ = self.ack.send(());
    }
}

/// Bounded channel feeding the worker dispatcher.
///
/// `send` succeeds only once the consumer acknowledged the event. An event
/// that is dropped, or not acknowledged within the timeout, stays
/// undelivered for the next redelivery sweep.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    sender: mpsc::Sender<Delivery>,
    ack_timeout: Duration,
}

impl LocalChannel {
    /// Create the channel and the receiving end for the dispatcher
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let channel = Self {
            sender,
            ack_timeout: Duration::from_secs(30),
        };
        (channel, receiver)
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }
}

#[async_trait]
impl NotificationChannel for LocalChannel {
    fn name(&self) -> &str {
        "local"
    }

    async fn send(&self, event: &EventRecord) -> Result<(), ChannelError> {
        let (ack, acked) = oneshot::channel();
        let delivery = Delivery {
            event: event.clone(),
            ack,
        };

        let handed_over = async {
            // Receiver gone: nobody consumes in this process
            self.sender
                .send(delivery)
                .await
                .map_err(|_| ChannelError::Closed)?;
            acked
                .await
                .map_err(|_| ChannelError::Delivery("event dropped before it was handled".into()))
        };

        match tokio::time::timeout(self.ack_timeout, handed_over).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Delivery(format!(
                "not acknowledged within {:?}",
                self.ack_timeout
            ))),
        }
    }
}

/// Delivers to every inner channel; fails if any of them fails
#[derive(Clone, Default)]
pub struct FanoutChannel {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl FanoutChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl NotificationChannel for FanoutChannel {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn send(&self, event: &EventRecord) -> Result<(), ChannelError> {
        let mut first_error = None;
        for channel in &self.channels {
            if let Err(e) = channel.send(event).await {
                tracing::warn!(channel = channel.name(), error = %e, "Channel delivery failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GenerationRequest;
    use std::collections::BTreeMap;

    fn event() -> EventRecord {
        let request = GenerationRequest::new("build-1", BTreeMap::new());
        EventRecord::for_transition(&request, None, Vec::new(), "Request created")
    }

    /// Acknowledge everything received, reporting the event ids
    fn acking(mut rx: mpsc::Receiver<Delivery>) -> tokio::task::JoinHandle<Vec<uuid::Uuid>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(delivery) = rx.recv().await {
                seen.push(delivery.event.id);
                delivery.ack();
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_local_channel_without_consumer_is_closed() {
        let (channel, rx) = LocalChannel::new(4);
        drop(rx);
        assert_eq!(channel.send(&event()).await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_local_channel_succeeds_once_acknowledged() {
        let (channel, rx) = LocalChannel::new(4);
        let consumer = acking(rx);
        let event = event();

        channel.send(&event).await.unwrap();
        drop(channel);
        assert_eq!(consumer.await.unwrap(), vec![event.id]);
    }

    #[tokio::test]
    async fn test_unacknowledged_event_is_not_delivered() {
        let (channel, mut rx) = LocalChannel::new(4);
        let channel = channel.with_ack_timeout(Duration::from_millis(20));

        let err = channel.send(&event()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Delivery(_)));
        // It reached the buffer, but was never confirmed
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_not_delivered() {
        let (channel, mut rx) = LocalChannel::new(4);
        let consumer = tokio::spawn(async move {
            let delivery = rx.recv().await;
            drop(delivery);
            rx
        });

        let err = channel.send(&event()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Delivery(_)));
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_fanout_reports_partial_failure() {
        let (healthy, rx) = LocalChannel::new(4);
        let consumer = acking(rx);
        let (closed, closed_rx) = LocalChannel::new(4);
        drop(closed_rx);
        let fanout = FanoutChannel::new()
            .with(Arc::new(healthy))
            .with(Arc::new(closed));

        let event = event();
        assert_eq!(fanout.send(&event).await, Err(ChannelError::Closed));
        drop(fanout);
        // The healthy channel still received it
        assert_eq!(consumer.await.unwrap(), vec![event.id]);
    }
}
