//! Worker dispatch.
//!
//! Workers are observers: they run after the fact, on their own tasks, and
//! their failures are logged without touching the request they observe.
//! An event taken from the local channel is acknowledged once all of its
//! handlers have finished, so the publisher never counts an event delivered
//! that no worker has seen.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use super::channel::Delivery;
use crate::domain::EventRecord;

/// An event-filtered follow-up handler.
///
/// `handle` may see the same event more than once and must be idempotent.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Key matched against the event's `worker` metadata entry
    fn interest_key(&self) -> &str;

    async fn handle(&self, event: &EventRecord) -> Result<()>;
}

/// Routes events to the workers interested in them
#[derive(Clone, Default)]
pub struct WorkerDispatcher {
    workers: Vec<Arc<dyn Worker>>,
}

impl WorkerDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Workers the event is routed to. Pure: reads metadata only.
    pub fn interested(&self, event: &EventRecord) -> Vec<Arc<dyn Worker>> {
        self.workers
            .iter()
            .filter(|w| event.is_routed_to(w.interest_key()))
            .cloned()
            .collect()
    }

    /// Spawn the matching handlers onto `tasks`; returns how many matched
    pub fn dispatch(&self, event: &EventRecord, tasks: &mut JoinSet<()>) -> usize {
        let workers = self.interested(event);
        if workers.is_empty() {
            debug!(event_id = %event.id, "No interested workers");
            return 0;
        }

        for worker in &workers {
            let worker = Arc::clone(worker);
            let event = event.clone();
            tasks.spawn(async move {
                let key = worker.interest_key().to_string();
                match worker.handle(&event).await {
                    Ok(()) => debug!(worker = %key, event_id = %event.id, "Worker handled event"),
                    Err(e) => error!(
                        worker = %key,
                        event_id = %event.id,
                        request_id = %event.request_id(),
                        error = %e,
                        "Worker failed to handle event"
                    ),
                }
            });
        }
        workers.len()
    }

    /// Run the event's handlers, acknowledging once all of them finished
    fn dispatch_acked(&self, delivery: Delivery, tasks: &mut JoinSet<()>) {
        let mut handlers = JoinSet::new();
        self.dispatch(&delivery.event, &mut handlers);
        tasks.spawn(async move {
            while handlers.join_next().await.is_some() {}
            delivery.ack();
        });
    }

    /// Consume events until shutdown, then drain and wait for handlers
    pub fn spawn(
        self,
        mut events: mpsc::Receiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            info!(workers = self.workers.len(), "Worker dispatcher started");

            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Some(delivery) => self.dispatch_acked(delivery, &mut tasks),
                        None => break,
                    },
                    Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                    _ = shutdown.changed() => {
                        events.close();
                        while let Ok(delivery) = events.try_recv() {
                            self.dispatch_acked(delivery, &mut tasks);
                        }
                        break;
                    }
                }
            }

            while tasks.join_next().await.is_some() {}
            info!("Worker dispatcher stopped");
        })
    }
}
