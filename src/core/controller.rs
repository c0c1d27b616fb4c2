//! Work queue and controller.
//!
//! Request ids are reconciled by a fixed pool of workers pulling from a
//! deduplicating queue. An id is never handed to two workers at once; an id
//! enqueued while it is being processed is marked dirty and re-queued when
//! the current pass ends.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::reconciler::{ReconcileOutcome, Reconciler};
use super::store::StoreError;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<Uuid>,
    queued: HashSet<Uuid>,
    processing: HashSet<Uuid>,
    dirty: HashSet<Uuid>,
    shutting_down: bool,
}

/// Deduplicating queue with per-id serialization
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, id: Uuid) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.processing.contains(&id) {
            state.dirty.insert(id);
            return;
        }
        if state.queued.insert(id) {
            state.queue.push_back(id);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Next id to process; `None` once the queue is shut down
    pub async fn get(&self) -> Option<Uuid> {
        loop {
            // Register before checking so a wakeup in between is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(id) = state.queue.pop_front() {
                    state.queued.remove(&id);
                    state.processing.insert(id);
                    return Some(id);
                }
            }
            notified.await;
        }
    }

    /// Release an id taken with `get`, re-queueing it if it went dirty
    pub fn done(&self, id: Uuid) {
        let mut state = self.lock();
        state.processing.remove(&id);
        if state.dirty.remove(&id) && !state.shutting_down && state.queued.insert(id) {
            state.queue.push_back(id);
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Ids waiting to be processed
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, id: Uuid) -> bool {
        self.lock().processing.contains(&id)
    }
}

/// Controller settings
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Number of parallel reconciliation workers
    pub workers: usize,

    /// How often every non-terminal request is re-enqueued
    pub resync_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(15),
        }
    }
}

/// Runs reconciliation passes for enqueued requests
pub struct Controller {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>, settings: ControllerSettings) -> Self {
        Self {
            reconciler,
            queue: Arc::new(WorkQueue::new()),
            settings,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// A request changed; schedule a pass
    pub fn enqueue(&self, id: Uuid) {
        self.queue.add(id);
    }

    /// An external job changed; schedule a pass for the request owning it
    #[instrument(skip(self))]
    pub async fn job_changed(&self, job_id: &str) -> Result<bool, StoreError> {
        match self.reconciler.store().find_job_ref(job_id).await? {
            Some(job) => {
                debug!(request_id = %job.request_id, "Job change mapped to request");
                self.queue.add(job.request_id);
                Ok(true)
            }
            None => {
                debug!("Job change for unknown job ignored");
                Ok(false)
            }
        }
    }

    /// Enqueue every non-terminal request
    pub async fn resync(&self) -> Result<usize, StoreError> {
        let requests = self.reconciler.store().list().await?;
        let mut count = 0;
        for request in requests.iter().filter(|r| !r.is_terminal()) {
            self.queue.add(request.id);
            count += 1;
        }
        debug!(count, "Resync enqueued requests");
        Ok(count)
    }

    /// Run workers and the resync timer until `shutdown` flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.settings.workers,
            resync_seconds = self.settings.resync_interval.as_secs(),
            "Controller started"
        );

        let mut workers = JoinSet::new();
        for worker in 0..self.settings.workers.max(1) {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            workers.spawn(work_loop(worker, queue, reconciler));
        }

        let period = self.settings.resync_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "Resync failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Controller stopping");
        self.queue.shutdown();
        while workers.join_next().await.is_some() {}
        info!("Controller stopped");
    }
}

async fn work_loop(worker: usize, queue: Arc<WorkQueue>, reconciler: Arc<Reconciler>) {
    while let Some(id) = queue.get().await {
        let outcome = reconciler.reconcile(id).await;
        queue.done(id);

        match outcome {
            // The new status may allow the next step right away
            Ok(ReconcileOutcome::Transitioned { .. }) | Ok(ReconcileOutcome::Abandoned) => {
                queue.add(id)
            }
            Ok(outcome) => debug!(worker, request_id = %id, ?outcome, "Pass complete"),
            Err(e) => error!(worker, request_id = %id, error = %e, "Reconciliation failed"),
        }
    }
}
