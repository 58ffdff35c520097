use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future;
use futures_util::FutureExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use drover_core::{Clock, DroverConfig, Job, NewJob, SystemClock};
use drover_cron::load_crontab_file;
use drover_store::{JobStore, SqliteJobStore};

use crate::cron::{Cron, CronItems};
use crate::error::{Result, WorkerError};
use crate::events::WorkerEvent;
use crate::options::CompiledOptions;
use crate::pool::WorkerPool;
use crate::registry::TaskRegistry;
use crate::releasers::Releasers;
use crate::signals::shutdown_signal;
use crate::worker::Completion;

struct RunnerState {
    options: Arc<CompiledOptions>,
    pool: Arc<WorkerPool>,
    cron: Arc<Cron>,
    cron_items: CronItems,
    running: AtomicBool,
    releasers: Mutex<Releasers>,
}

impl RunnerState {
    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyStopped);
        }
        info!("runner stopping");
        self.options.events.emit(WorkerEvent::RunnerStop);
        self.releasers.lock().await.release_all().await
    }
}

/// A worker pool and a cron scheduler sharing one store, stopped together.
///
/// If either side fails fatally the runner stops the other; the failure is
/// then reported by [`Runner::wait`].
pub struct Runner {
    state: Arc<RunnerState>,
    completion: Completion,
}

impl Runner {
    pub fn start(
        options: Arc<CompiledOptions>,
        tasks: Arc<dyn TaskRegistry>,
        cron_items: CronItems,
    ) -> Result<Self> {
        let names = tasks.names();
        if names.is_empty() {
            return Err(WorkerError::Config("no task handlers registered".into()));
        }
        for item in cron_items.current().iter() {
            if !names.contains(&item.task) {
                warn!(
                    identifier = %item.identifier,
                    task = %item.task,
                    "cron item schedules a task this runner cannot execute"
                );
            }
        }

        let cron = Arc::new(Cron::start(options.clone(), cron_items.clone()));
        let pool = WorkerPool::start(options.clone(), tasks);

        let mut releasers = Releasers::new();
        {
            let cron = cron.clone();
            releasers.push(move || cron.release().map(|_| Ok(())));
        }
        {
            let pool = pool.clone();
            releasers.push(move || pool.release().map(|_| Ok(())));
        }

        let state = Arc::new(RunnerState {
            options,
            pool,
            cron,
            cron_items,
            running: AtomicBool::new(true),
            releasers: Mutex::new(releasers),
        });

        let supervisor = state.clone();
        let handle = tokio::spawn(async move {
            let pool_done = supervisor.pool.completion();
            let cron_done = supervisor.cron.completion();
            let outcome = future::try_join(pool_done.clone(), cron_done.clone())
                .await
                .map(|_| ());
            if let Err(e) = &outcome {
                if supervisor.running.load(Ordering::SeqCst) {
                    error!(error = %e, "stopping runner due to an error");
                    if let Err(stop_error) = supervisor.stop().await {
                        warn!(error = %stop_error, "error while stopping runner");
                    }
                } else {
                    warn!(error = %e, "error occurred, but runner is already stopping");
                }
                let _ = future::join(pool_done, cron_done).await;
            }
            outcome
        });
        let completion = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(WorkerError::Fatal(format!("runner supervisor aborted: {e}"))),
            }
        }
        .boxed()
        .shared();

        Ok(Self { state, completion })
    }

    /// Open the SQLite store, load the configured crontab and start.
    pub async fn from_config(config: &DroverConfig, tasks: Arc<dyn TaskRegistry>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::from_config(config, clock.clone()).await?);
        let options = Arc::new(CompiledOptions::new(config, store, clock)?);
        let items = match &config.cron.crontab_path {
            Some(path) => load_crontab_file(Path::new(path))?,
            None => Vec::new(),
        };
        Self::start(options, tasks, CronItems::new(items))
    }

    /// Release the pool and the scheduler, then any extra releasers, newest
    /// first. A second call fails with [`WorkerError::AlreadyStopped`].
    pub async fn stop(&self) -> Result<()> {
        self.state.stop().await
    }

    /// Stop the runner on the first SIGINT, SIGTERM, SIGHUP, SIGUSR2 or
    /// SIGABRT (Ctrl+C off unix). Not installed unless asked for; the watcher
    /// exits on its own once the runner has stopped.
    pub fn stop_on_signals(&self) -> JoinHandle<()> {
        self.stop_when(async {
            match shutdown_signal().await {
                Ok(name) => name,
                Err(e) => {
                    warn!(error = %e, "could not install signal handlers");
                    std::future::pending().await
                }
            }
        })
    }

    /// Stop the runner once `trigger` resolves, logging its output as the
    /// reason. Does nothing if the runner stops first.
    pub fn stop_when<F>(&self, trigger: F) -> JoinHandle<()>
    where
        F: Future<Output = &'static str> + Send + 'static,
    {
        let state = self.state.clone();
        let completion = self.completion.clone();
        tokio::spawn(async move {
            tokio::select! {
                reason = trigger => {
                    info!(reason, "stop requested");
                    match state.stop().await {
                        Ok(()) | Err(WorkerError::AlreadyStopped) => {}
                        Err(e) => warn!(error = %e, "error while stopping runner"),
                    }
                }
                _ = completion => {}
            }
        })
    }

    /// Resolves when the runner has fully stopped.
    pub async fn wait(&self) -> Result<()> {
        self.completion.clone().await
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Run `release` on stop, before everything registered earlier.
    pub async fn add_releaser<F, Fut>(&self, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.state.releasers.lock().await.push(release);
    }

    /// Enqueue a job and wake an idle worker to pick it up.
    pub async fn add_job(&self, job: NewJob) -> Result<Job> {
        let job = self.state.options.store.add_job(job).await?;
        self.state.pool.nudge();
        Ok(job)
    }

    pub fn nudge(&self) -> bool {
        self.state.pool.nudge()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.state.options.events.subscribe()
    }

    pub fn options(&self) -> &Arc<CompiledOptions> {
        &self.state.options
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.state.pool
    }

    /// Handle for swapping the schedule while running.
    pub fn cron_items(&self) -> &CronItems {
        &self.state.cron_items
    }
}

/// Run `concurrency` workers until nothing is due, then return.
///
/// Any claim error or fatal worker error aborts the run.
pub async fn run_once(options: Arc<CompiledOptions>, tasks: Arc<dyn TaskRegistry>) -> Result<()> {
    if tasks.names().is_empty() {
        return Err(WorkerError::Config("no task handlers registered".into()));
    }
    let pool = WorkerPool::start_once(options, tasks);
    pool.wait().await
}
