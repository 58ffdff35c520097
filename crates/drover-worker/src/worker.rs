use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drover_core::Job;

use crate::error::{Result, WorkerError};
use crate::events::WorkerEvent;
use crate::helpers::JobHelpers;
use crate::options::CompiledOptions;
use crate::registry::TaskRegistry;
use crate::task::TaskOutput;

pub(crate) type Completion = Shared<BoxFuture<'static, Result<()>>>;

/// Random worker identifier: `worker-` plus 18 hex characters.
pub fn make_worker_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &hex[..18])
}

struct WorkerState {
    active: AtomicBool,
    /// Set by a nudge that arrived while the worker was busy: claim again
    /// right away instead of sleeping after an empty claim.
    again: AtomicBool,
    /// True only while sleeping between polls.
    idle: AtomicBool,
    wake: Notify,
    active_job: Mutex<Option<Arc<Job>>>,
}

/// Handle to one running worker. Cloning shares the same worker.
#[derive(Clone)]
pub struct Worker {
    worker_id: Arc<str>,
    state: Arc<WorkerState>,
    completion: Completion,
    options: Arc<CompiledOptions>,
}

impl Worker {
    /// Spawn a worker on the current runtime.
    ///
    /// A continuous worker polls until released; a one-shot worker exits
    /// as soon as a claim comes back empty, and treats any claim error as
    /// fatal.
    pub fn spawn(
        options: Arc<CompiledOptions>,
        tasks: Arc<dyn TaskRegistry>,
        continuous: bool,
    ) -> Self {
        let worker_id: Arc<str> = Arc::from(make_worker_id());
        let state = Arc::new(WorkerState {
            active: AtomicBool::new(true),
            again: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            wake: Notify::new(),
            active_job: Mutex::new(None),
        });

        options.events.emit(WorkerEvent::WorkerCreate {
            worker_id: worker_id.to_string(),
        });
        debug!(worker_id = %worker_id, continuous, "worker spawned");

        let run = WorkerLoop {
            worker_id: worker_id.clone(),
            state: state.clone(),
            options: options.clone(),
            tasks,
            continuous,
        };
        let events = options.events.clone();
        let id = worker_id.to_string();
        let handle = tokio::spawn(async move {
            let outcome = run.run().await;
            events.emit(WorkerEvent::WorkerStop {
                worker_id: id,
                error: outcome.as_ref().err().cloned(),
            });
            outcome
        });
        let completion = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(WorkerError::Fatal(format!("worker task aborted: {e}"))),
            }
        }
        .boxed()
        .shared();

        Self {
            worker_id,
            state,
            completion,
            options,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The job currently executing, if any.
    pub fn active_job(&self) -> Option<Arc<Job>> {
        self.state.active_job.lock().expect("worker state poisoned").clone()
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Wake the worker if it is sleeping between polls.
    ///
    /// Returns `true` only when an idle worker was woken. A busy worker
    /// remembers the nudge and claims again after its current job.
    pub fn nudge(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        if self
            .state
            .idle
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.state.wake.notify_one();
            true
        } else {
            self.state.again.store(true, Ordering::SeqCst);
            false
        }
    }

    /// Stop claiming. A job in flight runs to completion first.
    pub fn release(&self) -> Completion {
        if self.state.active.swap(false, Ordering::SeqCst) {
            debug!(worker_id = %self.worker_id, "worker released");
            self.options.events.emit(WorkerEvent::WorkerRelease {
                worker_id: self.worker_id.to_string(),
            });
            self.state.wake.notify_one();
        }
        self.completion.clone()
    }

    /// Resolves once the worker has exited.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("active", &self.is_active())
            .finish()
    }
}

struct WorkerLoop {
    worker_id: Arc<str>,
    state: Arc<WorkerState>,
    options: Arc<CompiledOptions>,
    tasks: Arc<dyn TaskRegistry>,
    continuous: bool,
}

impl WorkerLoop {
    async fn run(self) -> Result<()> {
        let mut contiguous_errors: u32 = 0;
        let events = &self.options.events;

        loop {
            if !self.state.active.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.state.again.store(false, Ordering::SeqCst);

            events.emit(WorkerEvent::ClaimStart {
                worker_id: self.worker_id.to_string(),
            });
            match self.claim().await {
                Err(e) => {
                    let error = WorkerError::Claim(Arc::new(e));
                    events.emit(WorkerEvent::ClaimError {
                        worker_id: self.worker_id.to_string(),
                        error: error.clone(),
                    });
                    if !self.continuous {
                        error!(worker_id = %self.worker_id, error = %error, "failed to acquire job");
                        return Err(error);
                    }
                    contiguous_errors += 1;
                    error!(
                        worker_id = %self.worker_id,
                        attempt = contiguous_errors,
                        limit = self.options.max_contiguous_errors,
                        error = %error,
                        "failed to acquire job"
                    );
                    if contiguous_errors >= self.options.max_contiguous_errors {
                        let fatal = WorkerError::Fatal(format!(
                            "Failed {contiguous_errors} times in a row to acquire job; latest error: {error}"
                        ));
                        events.emit(WorkerEvent::WorkerFatalError {
                            worker_id: self.worker_id.to_string(),
                            error: fatal.clone(),
                            job_error: None,
                        });
                        return Err(fatal);
                    }
                    self.idle_wait(self.options.poll_interval).await;
                }
                Ok(None) => {
                    contiguous_errors = 0;
                    events.emit(WorkerEvent::ClaimEmpty {
                        worker_id: self.worker_id.to_string(),
                    });
                    if !self.continuous {
                        return Ok(());
                    }
                    if !self.state.again.swap(false, Ordering::SeqCst) {
                        self.idle_wait(self.options.poll_interval).await;
                    }
                }
                Ok(Some(job)) => {
                    contiguous_errors = 0;
                    self.process(job).await?;
                }
            }
        }
    }

    async fn claim(&self) -> drover_store::Result<Option<Job>> {
        let names = self.tasks.names();
        let details = self.options.task_ids.get(&names).await?;
        let excluded = self.options.excluded_flags().await;
        self.options
            .store
            .claim(&self.worker_id, &details.task_ids, &excluded)
            .await
    }

    /// Sleep for `period` unless nudged or released first.
    async fn idle_wait(&self, period: Duration) {
        self.state.idle.store(true, Ordering::SeqCst);
        if self.state.active.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = self.state.wake.notified() => {}
            }
        }
        self.state.idle.store(false, Ordering::SeqCst);
    }

    async fn process(&self, job: Job) -> Result<()> {
        let job = Arc::new(job);
        let events = &self.options.events;
        let store = &self.options.store;
        *self.state.active_job.lock().expect("worker state poisoned") = Some(job.clone());
        events.emit(WorkerEvent::JobStart {
            worker_id: self.worker_id.to_string(),
            job: job.clone(),
        });

        let Some(handler) = self.tasks.lookup(&job.task_identifier) else {
            let error = WorkerError::UnsupportedTask(job.task_identifier.clone());
            // Unlock the job so another process that supports it can pick it up.
            if let Err(e) = store.fail(&self.worker_id, &job, &error.to_string(), None).await {
                warn!(worker_id = %self.worker_id, job_id = job.id, error = %e, "could not unlock unsupported job");
            }
            error!(worker_id = %self.worker_id, job_id = job.id, task = %job.task_identifier, "unsupported task");
            self.clear_active_job();
            events.emit(WorkerEvent::WorkerFatalError {
                worker_id: self.worker_id.to_string(),
                error: error.clone(),
                job_error: None,
            });
            return Err(error);
        };

        let started = Instant::now();
        let helpers = JobHelpers::new(job.clone(), &self.worker_id, store.clone());
        // Building the future runs the handler's synchronous prefix, so it
        // belongs inside the unwind guard too.
        let payload = job.payload.clone();
        let outcome = AssertUnwindSafe(async move { handler.run(payload, helpers).await })
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(error_message(&e)),
            Err(panic) => Err(panic_message(panic)),
        };

        let mut batch_errors = Vec::new();
        let mut failed_items = Vec::new();
        let failure = match result {
            Err(message) => Some(message),
            Ok(TaskOutput::Batch(outcomes)) => {
                match job.payload.as_array().filter(|items| items.len() == outcomes.len()) {
                    Some(items) => {
                        let settled = join_all(
                            outcomes
                                .into_iter()
                                .map(|outcome| AssertUnwindSafe(outcome).catch_unwind()),
                        )
                        .await;
                        for (item, settled) in items.iter().zip(settled) {
                            let message = match settled {
                                Ok(Ok(())) => continue,
                                Ok(Err(e)) => error_message(&e),
                                Err(panic) => panic_message(panic),
                            };
                            failed_items.push(item.clone());
                            batch_errors.push(message);
                        }
                        (!batch_errors.is_empty())
                            .then(|| format!("Batch failures:\n{}", batch_errors.join("\n")))
                    }
                    None => {
                        warn!(
                            worker_id = %self.worker_id,
                            job_id = job.id,
                            task = %job.task_identifier,
                            "batch output does not match the payload array length; treating as success"
                        );
                        None
                    }
                }
            }
            Ok(_) => None,
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let resolved = match &failure {
            Some(message) => {
                events.emit(WorkerEvent::JobError {
                    worker_id: self.worker_id.to_string(),
                    job: job.clone(),
                    error: message.clone(),
                    batch_errors: batch_errors.clone(),
                });
                if job.attempts >= job.max_attempts {
                    events.emit(WorkerEvent::JobFailed {
                        worker_id: self.worker_id.to_string(),
                        job: job.clone(),
                        error: message.clone(),
                        batch_errors: batch_errors.clone(),
                    });
                }
                error!(
                    worker_id = %self.worker_id,
                    job_id = job.id,
                    task = %job.task_identifier,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    duration_ms,
                    error = %message,
                    "job failed"
                );
                let replacement = (!failed_items.is_empty()).then(|| Value::Array(failed_items));
                store
                    .fail(&self.worker_id, &job, message, replacement)
                    .await
            }
            None => {
                events.emit(WorkerEvent::JobSuccess {
                    worker_id: self.worker_id.to_string(),
                    job: job.clone(),
                });
                if self.options.log_success {
                    info!(
                        worker_id = %self.worker_id,
                        job_id = job.id,
                        task = %job.task_identifier,
                        duration_ms,
                        "job completed"
                    );
                }
                store.complete(&self.worker_id, &job).await
            }
        };
        self.clear_active_job();

        match resolved {
            Ok(()) => {
                events.emit(WorkerEvent::JobComplete {
                    worker_id: self.worker_id.to_string(),
                    job,
                    error: failure,
                });
                Ok(())
            }
            Err(e) => {
                let when = if failure.is_some() { "after failure" } else { "after success" };
                let fatal = WorkerError::Fatal(format!(
                    "Failed to release job '{}' {when}: {e}",
                    job.id
                ));
                error!(worker_id = %self.worker_id, job_id = job.id, error = %e, "failed to release job {when}");
                events.emit(WorkerEvent::WorkerFatalError {
                    worker_id: self.worker_id.to_string(),
                    error: fatal.clone(),
                    job_error: failure,
                });
                Err(fatal)
            }
        }
    }

    fn clear_active_job(&self) {
        *self.state.active_job.lock().expect("worker state poisoned") = None;
    }
}

fn error_message(e: &anyhow::Error) -> String {
    let message = format!("{e:#}");
    if message.is_empty() {
        "Non error or error without message thrown.".to_string()
    } else {
        message
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}
