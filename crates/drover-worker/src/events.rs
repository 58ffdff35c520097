use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use drover_core::Job;

use crate::error::WorkerError;

const EVENT_CAPACITY: usize = 1024;

/// Lifecycle notifications. Delivery is best effort: a slow subscriber lags
/// and loses events, it never blocks a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    PoolCreate { concurrency: usize },
    PoolRelease,
    WorkerCreate { worker_id: String },
    WorkerRelease { worker_id: String },
    WorkerStop { worker_id: String, error: Option<WorkerError> },
    ClaimStart { worker_id: String },
    ClaimEmpty { worker_id: String },
    ClaimError { worker_id: String, error: WorkerError },
    JobStart { worker_id: String, job: Arc<Job> },
    JobSuccess { worker_id: String, job: Arc<Job> },
    JobError {
        worker_id: String,
        job: Arc<Job>,
        error: String,
        batch_errors: Vec<String>,
    },
    /// The job used its last attempt; the row stays in the store.
    JobFailed {
        worker_id: String,
        job: Arc<Job>,
        error: String,
        batch_errors: Vec<String>,
    },
    JobComplete {
        worker_id: String,
        job: Arc<Job>,
        error: Option<String>,
    },
    WorkerFatalError {
        worker_id: String,
        error: WorkerError,
        job_error: Option<String>,
    },
    ResetLockedSuccess { jobs: usize, queues: usize },
    ResetLockedFailure { error: WorkerError },
    CronSchedule { ts: DateTime<Utc>, identifiers: Vec<String> },
    CronBackfill { ts: DateTime<Utc>, identifiers: Vec<String> },
    RunnerStop,
}

/// Broadcast bus shared by every component of one run.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget: no subscribers is not an error.
    pub fn emit(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
