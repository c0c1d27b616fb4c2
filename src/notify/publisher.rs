//! Outbox-style event publisher.
//!
//! Runs on its own task. Events arrive over an unbounded channel after the
//! status change is committed; each is delivered with backoff and then
//! marked delivered in the store. A periodic sweep re-sends whatever the
//! store still lists as undelivered, so delivery is at-least-once.
//!
//! Events of one request are delivered in causal order: once an event of a
//! request fails, later events of that request wait for the next sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{ChannelError, NotificationChannel};
use crate::core::{RequestStore, RetryPolicy};
use crate::domain::EventRecord;

enum Command {
    Publish(EventRecord),
    Flush(oneshot::Sender<()>),
    Redeliver(oneshot::Sender<usize>),
}

/// Cheap, cloneable handle used by the reconciler to hand events over
#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl PublisherHandle {
    /// Hand an event over; never blocks and never fails the caller
    pub fn publish(&self, event: EventRecord) {
        let id = event.id;
        if self.tx.send(Command::Publish(event)).is_err() {
            warn!(event_id = %id, "Publisher stopped, event left for redelivery");
        }
    }

    /// Wait until every event handed over so far has been processed
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Run a redelivery sweep now; returns the number of events delivered
    pub async fn redeliver(&self) -> usize {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Redeliver(done)).is_err() {
            return 0;
        }
        wait.await.unwrap_or(0)
    }
}

/// Delivers committed events to a notification channel
pub struct EventPublisher {
    store: Arc<dyn RequestStore>,
    channel: Arc<dyn NotificationChannel>,
    retry: RetryPolicy,
    redelivery_interval: Duration,
}

impl EventPublisher {
    pub fn new(store: Arc<dyn RequestStore>, channel: Arc<dyn NotificationChannel>) -> Self {
        Self {
            store,
            channel,
            retry: RetryPolicy::default(),
            redelivery_interval: Duration::from_secs(30),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_redelivery_interval(mut self, interval: Duration) -> Self {
        self.redelivery_interval = interval;
        self
    }

    /// Start the publisher task
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (PublisherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx, shutdown));
        (PublisherHandle { tx }, task)
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>, mut shutdown: watch::Receiver<bool>) {
        let mut state = DeliveryState::default();
        let period = self.redelivery_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(channel = self.channel.name(), "Event publisher started");

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command, &mut state).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.sweep(&mut state).await;
                }
                _ = shutdown.changed() => {
                    while let Ok(command) = rx.try_recv() {
                        self.handle(command, &mut state).await;
                    }
                    break;
                }
            }
        }

        info!("Event publisher stopped");
    }

    async fn handle(&self, command: Command, state: &mut DeliveryState) {
        match command {
            Command::Publish(event) => {
                if state.swept.contains(&event.id) {
                    debug!(event_id = %event.id, "Already delivered by redelivery sweep");
                } else if state.blocked.contains(&event.request_id()) {
                    debug!(event_id = %event.id, "Earlier event undelivered, deferring");
                } else if !self.deliver(&event).await {
                    state.blocked.insert(event.request_id());
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Redeliver(done) => {
                let delivered = self.sweep(state).await;
                let _ = done.send(delivered);
            }
        }
    }

    /// Re-send every undelivered event in creation order
    async fn sweep(&self, state: &mut DeliveryState) -> usize {
        let pending = match self.store.undelivered_events().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Failed to list undelivered events");
                return 0;
            }
        };

        state.blocked.clear();
        state.swept.clear();
        if pending.is_empty() {
            return 0;
        }

        debug!(count = pending.len(), "Redelivering events");
        let mut delivered = 0;
        for event in pending {
            if state.blocked.contains(&event.request_id()) {
                continue;
            }
            if self.deliver(&event).await {
                state.swept.insert(event.id);
                delivered += 1;
            } else {
                state.blocked.insert(event.request_id());
            }
        }
        delivered
    }

    /// Deliver with backoff and record success; `false` leaves it pending
    #[instrument(skip(self, event), fields(event_id = %event.id, request_id = %event.request_id(), status = %event.status))]
    pub async fn deliver(&self, event: &EventRecord) -> bool {
        let mut attempt = 1;
        loop {
            match self.channel.send(event).await {
                Ok(()) => break,
                Err(ChannelError::Closed) => {
                    debug!(channel = self.channel.name(), "Channel closed, event stays pending");
                    return false;
                }
                Err(e) if self.retry.allows_another(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(attempt, ?delay, error = %e, "Delivery failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Delivery failed, leaving event for redelivery");
                    return false;
                }
            }
        }

        if let Err(e) = self.store.mark_delivered(event.id).await {
            // Delivered but not recorded: the sweep will send it again
            warn!(error = %e, "Failed to mark event delivered");
        }
        debug!(channel = self.channel.name(), "Event delivered");
        true
    }
}

#[derive(Default)]
struct DeliveryState {
    /// Requests with an undelivered event; later events wait
    blocked: HashSet<Uuid>,

    /// Events delivered by the last sweep
    swept: HashSet<Uuid>,
}
