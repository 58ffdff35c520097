use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{Result, WorkerError};
use crate::events::WorkerEvent;
use crate::options::CompiledOptions;
use crate::registry::TaskRegistry;
use crate::worker::{Completion, Worker};

/// `concurrency` workers sharing one store, plus the stale-lock sweeper.
///
/// The pool completes when every worker has exited. The first worker to
/// fail fatally releases all the others and its error becomes the pool's.
pub struct WorkerPool {
    options: Arc<CompiledOptions>,
    workers: Vec<Worker>,
    released: AtomicBool,
    stop_sweeper: watch::Sender<bool>,
    completion: Completion,
}

impl WorkerPool {
    pub fn start(options: Arc<CompiledOptions>, tasks: Arc<dyn TaskRegistry>) -> Arc<Self> {
        Self::spawn(options, tasks, true)
    }

    /// Workers that drain what is currently due and exit. No sweeper.
    pub fn start_once(options: Arc<CompiledOptions>, tasks: Arc<dyn TaskRegistry>) -> Arc<Self> {
        Self::spawn(options, tasks, false)
    }

    fn spawn(options: Arc<CompiledOptions>, tasks: Arc<dyn TaskRegistry>, continuous: bool) -> Arc<Self> {
        options.events.emit(WorkerEvent::PoolCreate {
            concurrency: options.concurrency,
        });
        info!(
            concurrency = options.concurrency,
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            schema = %options.schema,
            "worker pool started"
        );

        let (stop_sweeper, stop_rx) = watch::channel(false);
        if continuous {
            tokio::spawn(sweep_stale_locks(options.clone(), stop_rx));
        }

        let workers: Vec<Worker> = (0..options.concurrency)
            .map(|_| Worker::spawn(options.clone(), tasks.clone(), continuous))
            .collect();

        let supervised = workers.clone();
        let sweeper = stop_sweeper.clone();
        let handle = tokio::spawn(async move {
            let mut pending: FuturesUnordered<_> =
                supervised.iter().map(|w| w.completion()).collect();
            let mut first_error: Option<WorkerError> = None;
            while let Some(outcome) = pending.next().await {
                if let Err(e) = outcome {
                    if first_error.is_none() {
                        error!(error = %e, "worker exited with an error; releasing pool");
                        for worker in &supervised {
                            let _ = worker.release();
                        }
                        first_error = Some(e);
                    }
                }
            }
            let _ = sweeper.send(true);
            debug!("all workers exited");
            first_error.map_or(Ok(()), Err)
        });
        let completion = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(WorkerError::Fatal(format!("pool supervisor aborted: {e}"))),
            }
        }
        .boxed()
        .shared();

        Arc::new(Self {
            options,
            workers,
            released: AtomicBool::new(false),
            stop_sweeper,
            completion,
        })
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Wake one idle worker. Returns `false` when every worker is busy.
    pub fn nudge(&self) -> bool {
        self.workers.iter().any(|w| w.nudge())
    }

    /// Release every worker; idempotent. Resolves with the pool outcome.
    pub fn release(&self) -> Completion {
        if !self.released.swap(true, Ordering::SeqCst) {
            info!("worker pool releasing");
            self.options.events.emit(WorkerEvent::PoolRelease);
            let _ = self.stop_sweeper.send(true);
            for worker in &self.workers {
                let _ = worker.release();
            }
        }
        self.completion.clone()
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    pub async fn wait(&self) -> Result<()> {
        self.completion.clone().await
    }
}

/// Reset stale locks once at startup, then at a random interval in
/// `[min, max]` so that many processes do not sweep in lockstep.
async fn sweep_stale_locks(options: Arc<CompiledOptions>, mut stop: watch::Receiver<bool>) {
    loop {
        match options.store.reset_stale_locks().await {
            Ok(counts) => {
                if counts.jobs > 0 || counts.queues > 0 {
                    info!(jobs = counts.jobs, queues = counts.queues, "stale locks reset");
                }
                options.events.emit(WorkerEvent::ResetLockedSuccess {
                    jobs: counts.jobs,
                    queues: counts.queues,
                });
            }
            Err(e) => {
                error!(error = %e, "failed to reset stale locks");
                options.events.emit(WorkerEvent::ResetLockedFailure { error: e.into() });
            }
        }

        let delay = next_sweep_delay(
            options.min_reset_locked_interval,
            options.max_reset_locked_interval,
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => return,
        }
        if *stop.borrow() {
            return;
        }
    }
}

fn next_sweep_delay(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}
