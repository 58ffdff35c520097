use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use drover_core::{DroverConfig, Job, JobQueue, KnownCrontab, NewJob, SystemClock};
use drover_store::{
    JobStore, MemoryJobStore, ResetCounts, SqliteJobStore, StoreError, TaskDetails,
};
use drover_worker::{
    run_once, CompiledOptions, CronItems, ForbiddenFlags, JobHelpers, Runner, TaskHandler,
    TaskList, TaskOutput, TaskRegistry, WorkerError, WorkerEvent,
};

const WAIT: Duration = Duration::from_secs(10);

fn config(concurrency: usize, poll_interval_ms: u64) -> DroverConfig {
    let mut config = DroverConfig::default();
    config.worker.concurrency = concurrency;
    config.worker.poll_interval_ms = poll_interval_ms;
    config.worker.log_success = false;
    config
}

fn memory_store() -> Arc<MemoryJobStore> {
    Arc::new(MemoryJobStore::new(Arc::new(SystemClock)))
}

fn options(config: &DroverConfig, store: Arc<dyn JobStore>) -> Arc<CompiledOptions> {
    Arc::new(CompiledOptions::new(config, store, Arc::new(SystemClock)).unwrap())
}

/// Wait for the first event matching `pick`.
async fn next_event<T>(
    rx: &mut broadcast::Receiver<WorkerEvent>,
    mut pick: impl FnMut(WorkerEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn completed(event: WorkerEvent) -> Option<(Arc<Job>, Option<String>)> {
    match event {
        WorkerEvent::JobComplete { job, error, .. } => Some((job, error)),
        _ => None,
    }
}

async fn ok_task(_: Value, _: JobHelpers) -> anyhow::Result<TaskOutput> {
    Ok(TaskOutput::Done)
}

async fn failing_task(_: Value, _: JobHelpers) -> anyhow::Result<TaskOutput> {
    Err(anyhow!("upstream unavailable"))
}

async fn panicking_task(_: Value, _: JobHelpers) -> anyhow::Result<TaskOutput> {
    panic!("handler bug");
}

/// Each element succeeds unless it is the string "bad".
async fn batch_task(payload: Value, _: JobHelpers) -> anyhow::Result<TaskOutput> {
    let items = payload.as_array().cloned().unwrap_or_default();
    Ok(TaskOutput::Batch(
        items
            .into_iter()
            .map(|item| -> drover_worker::BatchOutcome {
                Box::pin(async move {
                    if item == "bad" {
                        Err(anyhow!("bad element"))
                    } else {
                        Ok(())
                    }
                })
            })
            .collect(),
    ))
}

#[tokio::test]
async fn jobs_run_and_are_deleted() {
    let store = memory_store();
    let opts = options(&config(2, 20), store.clone());
    let mut events = opts.events.subscribe();
    let tasks = TaskList::new().with("ok", ok_task);
    let runner = Runner::start(opts, Arc::new(tasks), CronItems::default()).unwrap();

    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(runner.add_job(NewJob::new("ok", json!({ "n": n }))).await.unwrap().id);
    }
    for _ in 0..3 {
        let (_, error) = next_event(&mut events, completed).await;
        assert!(error.is_none());
    }
    for id in ids {
        assert!(store.get_job(id).await.unwrap().is_none());
    }

    runner.stop().await.unwrap();
    runner.wait().await.unwrap();
}

#[tokio::test]
async fn failure_is_recorded_and_rescheduled() {
    let store = memory_store();
    let opts = options(&config(1, 20), store.clone());
    let mut events = opts.events.subscribe();
    let runner =
        Runner::start(opts, Arc::new(TaskList::new().with("flaky", failing_task)), CronItems::default())
            .unwrap();

    let job = runner.add_job(NewJob::new("flaky", json!({}))).await.unwrap();
    let error = next_event(&mut events, |e| match e {
        WorkerEvent::JobError { error, .. } => Some(error),
        _ => None,
    })
    .await;
    assert_eq!(error, "upstream unavailable");
    next_event(&mut events, completed).await;

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.last_error.as_deref(), Some("upstream unavailable"));
    assert!(stored.locked_by.is_none());
    assert!(stored.run_at > job.run_at + chrono::Duration::seconds(2));

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn last_attempt_emits_job_failed() {
    let store = memory_store();
    let opts = options(&config(1, 20), store.clone());
    let mut events = opts.events.subscribe();
    let runner =
        Runner::start(opts, Arc::new(TaskList::new().with("flaky", failing_task)), CronItems::default())
            .unwrap();

    let job = runner
        .add_job(NewJob::new("flaky", json!({})).with_max_attempts(1))
        .await
        .unwrap();
    let failed = next_event(&mut events, |e| match e {
        WorkerEvent::JobFailed { job, .. } => Some(job),
        _ => None,
    })
    .await;
    assert_eq!(failed.id, job.id);
    next_event(&mut events, completed).await;

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert!(stored.is_permanently_failed());
    runner.stop().await.unwrap();
}

#[tokio::test]
async fn panics_become_job_failures() {
    let store = memory_store();
    let opts = options(&config(1, 20), store.clone());
    let mut events = opts.events.subscribe();
    let runner =
        Runner::start(opts, Arc::new(TaskList::new().with("buggy", panicking_task)), CronItems::default())
            .unwrap();

    let job = runner.add_job(NewJob::new("buggy", json!({}))).await.unwrap();
    let (_, error) = next_event(&mut events, completed).await;
    assert_eq!(error.as_deref(), Some("task panicked: handler bug"));
    assert!(store.get_job(job.id).await.unwrap().is_some());

    runner.stop().await.unwrap();
    runner.wait().await.unwrap();
}

/// Panics while building its future rather than while polling it.
struct EagerPanic;

impl TaskHandler for EagerPanic {
    fn run<'life0, 'async_trait>(
        &'life0 self,
        _: Value,
        _: JobHelpers,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<TaskOutput>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        Self: 'async_trait,
    {
        panic!("bad config");
    }
}

#[tokio::test]
async fn synchronous_panics_become_job_failures() {
    let store = memory_store();
    let opts = options(&config(1, 20), store.clone());
    let mut events = opts.events.subscribe();
    let runner =
        Runner::start(opts, Arc::new(TaskList::new().with("eager", EagerPanic)), CronItems::default())
            .unwrap();

    let job = runner.add_job(NewJob::new("eager", json!({}))).await.unwrap();
    let (_, error) = next_event(&mut events, completed).await;
    assert_eq!(error.as_deref(), Some("task panicked: bad config"));
    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);

    // The worker survived and still runs jobs.
    runner.add_job(NewJob::new("eager", json!({}))).await.unwrap();
    next_event(&mut events, completed).await;
    assert!(runner.is_running());

    runner.stop().await.unwrap();
    runner.wait().await.unwrap();
}

/// Returns one outcome however long the payload is.
async fn short_batch_task(_: Value, _: JobHelpers) -> anyhow::Result<TaskOutput> {
    let outcome: drover_worker::BatchOutcome = Box::pin(async { Err(anyhow!("never counted")) });
    Ok(TaskOutput::Batch(vec![outcome]))
}

#[tokio::test]
async fn mismatched_batch_output_counts_as_success() {
    let store = memory_store();
    let opts = options(&config(1, 20), store.clone());
    let mut events = opts.events.subscribe();
    let runner = Runner::start(
        opts,
        Arc::new(TaskList::new().with("short", short_batch_task)),
        CronItems::default(),
    )
    .unwrap();

    let job = runner
        .add_job(NewJob::new("short", json!(["a", "b", "c"])))
        .await
        .unwrap();
    let (done, error) = next_event(&mut events, completed).await;
    assert_eq!(done.id, job.id);
    assert!(error.is_none());
    assert!(store.get_job(job.id).await.unwrap().is_none());

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn batch_retries_only_failed_elements() {
    let store = memory_store();
    let opts = options(&config(1, 20), store.clone());
    let mut events = opts.events.subscribe();
    let runner =
        Runner::start(opts, Arc::new(TaskList::new().with("batch", batch_task)), CronItems::default())
            .unwrap();

    let job = runner
        .add_job(NewJob::new("batch", json!(["a", "bad", "c"])))
        .await
        .unwrap();
    let batch_errors = next_event(&mut events, |e| match e {
        WorkerEvent::JobError { batch_errors, .. } => Some(batch_errors),
        _ => None,
    })
    .await;
    assert_eq!(batch_errors, vec!["bad element"]);
    next_event(&mut events, completed).await;

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.payload, json!(["bad"]));
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.last_error.as_deref(), Some("Batch failures:\nbad element"));

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn queue_jobs_run_serially_in_order() {
    let store = memory_store();
    let opts = options(&config(3, 10), store.clone());
    let mut events = opts.events.subscribe();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = {
        let seen = seen.clone();
        move |payload: Value, _: JobHelpers| {
            let seen = seen.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.lock().unwrap().push(payload["n"].as_i64().unwrap());
                Ok::<_, anyhow::Error>(TaskOutput::Done)
            }
        }
    };

    for n in 0..5 {
        store
            .add_job(NewJob::new("record", json!({ "n": n })).with_queue("serial"))
            .await
            .unwrap();
    }
    let runner =
        Runner::start(opts, Arc::new(TaskList::new().with("record", record)), CronItems::default())
            .unwrap();
    for _ in 0..5 {
        next_event(&mut events, completed).await;
    }
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(store.job_queues().await.unwrap().is_empty());

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn add_job_nudges_an_idle_worker() {
    let store = memory_store();
    // Poll far slower than the test timeout: only a nudge can pick the job up in time.
    let opts = options(&config(1, 60_000), store.clone());
    let mut events = opts.events.subscribe();
    let runner =
        Runner::start(opts, Arc::new(TaskList::new().with("ok", ok_task)), CronItems::default()).unwrap();

    next_event(&mut events, |e| matches!(e, WorkerEvent::ClaimEmpty { .. }).then_some(())).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    runner.add_job(NewJob::new("ok", json!({}))).await.unwrap();
    let (_, error) = tokio::time::timeout(Duration::from_secs(2), next_event(&mut events, completed))
        .await
        .expect("nudged worker should run the job promptly");
    assert!(error.is_none());

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn pool_nudge_wakes_a_single_idle_worker() {
    let store = memory_store();
    let opts = options(&config(3, 60_000), store.clone());
    let mut events = opts.events.subscribe();
    let runner =
        Runner::start(opts, Arc::new(TaskList::new().with("ok", ok_task)), CronItems::default()).unwrap();

    for _ in 0..3 {
        next_event(&mut events, |e| matches!(e, WorkerEvent::ClaimEmpty { .. }).then_some(())).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(runner.nudge());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut woken = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WorkerEvent::ClaimStart { worker_id } = event {
            woken.push(worker_id);
        }
    }
    assert_eq!(woken.len(), 1);

    runner.stop().await.unwrap();
}

#[tokio::test]
async fn stopping_twice_is_an_error() {
    let store = memory_store();
    let runner = Runner::start(
        options(&config(1, 20), store),
        Arc::new(TaskList::new().with("ok", ok_task)),
        CronItems::default(),
    )
    .unwrap();

    runner.stop().await.unwrap();
    assert!(matches!(runner.stop().await, Err(WorkerError::AlreadyStopped)));
    runner.wait().await.unwrap();
    assert!(!runner.is_running());
}

#[tokio::test]
async fn releasers_run_on_stop() {
    let runner = Runner::start(
        options(&config(1, 20), memory_store()),
        Arc::new(TaskList::new().with("ok", ok_task)),
        CronItems::default(),
    )
    .unwrap();
    let closed = Arc::new(Mutex::new(false));
    let flag = closed.clone();
    runner
        .add_releaser(move || async move {
            *flag.lock().unwrap() = true;
            Ok(())
        })
        .await;

    runner.stop().await.unwrap();
    assert!(*closed.lock().unwrap());
}

#[tokio::test]
async fn stop_trigger_stops_the_runner_once() {
    let runner = Runner::start(
        options(&config(1, 20), memory_store()),
        Arc::new(TaskList::new().with("ok", ok_task)),
        CronItems::default(),
    )
    .unwrap();
    let releases = Arc::new(Mutex::new(0));
    let counter = releases.clone();
    runner
        .add_releaser(move || async move {
            *counter.lock().unwrap() += 1;
            Ok(())
        })
        .await;

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let first = runner.stop_when(async move {
        let _ = rx.await;
        "test trigger"
    });
    let second = runner.stop_when(async { "another trigger" });
    tx.send(()).unwrap();

    tokio::time::timeout(WAIT, first).await.unwrap().unwrap();
    tokio::time::timeout(WAIT, second).await.unwrap().unwrap();
    tokio::time::timeout(WAIT, runner.wait()).await.unwrap().unwrap();
    assert!(!runner.is_running());
    assert_eq!(*releases.lock().unwrap(), 1);
}

#[tokio::test]
async fn signal_watcher_exits_with_the_runner() {
    let runner = Runner::start(
        options(&config(1, 20), memory_store()),
        Arc::new(TaskList::new().with("ok", ok_task)),
        CronItems::default(),
    )
    .unwrap();
    let watcher = runner.stop_on_signals();
    assert!(!watcher.is_finished());

    runner.stop().await.unwrap();
    tokio::time::timeout(WAIT, watcher).await.unwrap().unwrap();
}

#[test]
fn runner_requires_tasks() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let result = Runner::start(
            options(&config(1, 20), memory_store()),
            Arc::new(TaskList::new()),
            CronItems::default(),
        );
        assert!(matches!(result, Err(WorkerError::Config(_))));
    });
}

/// Advertises a task it cannot look up.
struct Forgetful;

impl TaskRegistry for Forgetful {
    fn lookup(&self, _: &str) -> Option<Arc<dyn TaskHandler>> {
        None
    }

    fn names(&self) -> Vec<String> {
        vec!["ghost".to_string()]
    }
}

#[tokio::test]
async fn missing_handler_is_fatal_but_unlocks_job() {
    let store = memory_store();
    let job = store.add_job(NewJob::new("ghost", json!({}))).await.unwrap();
    let runner = Runner::start(
        options(&config(1, 20), store.clone()),
        Arc::new(Forgetful),
        CronItems::default(),
    )
    .unwrap();

    let outcome = tokio::time::timeout(WAIT, runner.wait()).await.unwrap();
    assert!(matches!(outcome, Err(WorkerError::UnsupportedTask(ref t)) if t == "ghost"));
    assert!(!runner.is_running());

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert!(stored.locked_by.is_none());
    assert_eq!(stored.last_error.as_deref(), Some("Unsupported task 'ghost'"));
}

/// Delegates to a memory store, failing claims or completions on demand.
struct FaultyStore {
    inner: MemoryJobStore,
    claims_fail: bool,
    completions_fail: bool,
}

impl FaultyStore {
    fn broken_claims() -> Self {
        Self {
            inner: MemoryJobStore::new(Arc::new(SystemClock)),
            claims_fail: true,
            completions_fail: false,
        }
    }

    fn broken_completions() -> Self {
        Self {
            inner: MemoryJobStore::new(Arc::new(SystemClock)),
            claims_fail: false,
            completions_fail: true,
        }
    }
}

#[async_trait]
impl JobStore for FaultyStore {
    async fn add_job(&self, job: NewJob) -> drover_store::Result<Job> {
        self.inner.add_job(job).await
    }
    async fn claim(&self, w: &str, ids: &[i64], flags: &[String]) -> drover_store::Result<Option<Job>> {
        if self.claims_fail {
            return Err(StoreError::Config("database is locked".into()));
        }
        self.inner.claim(w, ids, flags).await
    }
    async fn complete(&self, w: &str, job: &Job) -> drover_store::Result<()> {
        if self.completions_fail {
            return Err(StoreError::Config("disk I/O error".into()));
        }
        self.inner.complete(w, job).await
    }
    async fn fail(&self, w: &str, job: &Job, m: &str, p: Option<Value>) -> drover_store::Result<()> {
        self.inner.fail(w, job, m, p).await
    }
    async fn reset_stale_locks(&self) -> drover_store::Result<ResetCounts> {
        self.inner.reset_stale_locks().await
    }
    async fn intern_task_names(&self, names: &[String]) -> drover_store::Result<TaskDetails> {
        self.inner.intern_task_names(names).await
    }
    async fn register_known_crontabs(&self, ids: &[String]) -> drover_store::Result<()> {
        self.inner.register_known_crontabs(ids).await
    }
    async fn known_crontabs(&self, ids: &[String]) -> drover_store::Result<Vec<KnownCrontab>> {
        self.inner.known_crontabs(ids).await
    }
    async fn fire_cron_job(
        &self,
        identifier: &str,
        ts: DateTime<Utc>,
        job: NewJob,
    ) -> drover_store::Result<Option<Job>> {
        self.inner.fire_cron_job(identifier, ts, job).await
    }
    async fn get_job(&self, id: i64) -> drover_store::Result<Option<Job>> {
        self.inner.get_job(id).await
    }
    async fn job_queues(&self) -> drover_store::Result<Vec<JobQueue>> {
        self.inner.job_queues().await
    }
}

#[tokio::test]
async fn repeated_claim_errors_stop_the_runner() {
    let store = Arc::new(FaultyStore::broken_claims());
    let mut cfg = config(1, 5);
    cfg.worker.max_contiguous_errors = 3;
    let runner = Runner::start(
        options(&cfg, store),
        Arc::new(TaskList::new().with("ok", ok_task)),
        CronItems::default(),
    )
    .unwrap();

    let outcome = tokio::time::timeout(WAIT, runner.wait()).await.unwrap();
    let message = match outcome {
        Err(WorkerError::Fatal(message)) => message,
        other => panic!("expected fatal error, got {other:?}"),
    };
    assert!(message.starts_with("Failed 3 times in a row to acquire job; latest error:"));
    assert!(matches!(runner.stop().await, Err(WorkerError::AlreadyStopped)));
}

#[tokio::test]
async fn release_failure_after_success_is_fatal() {
    let store = Arc::new(FaultyStore::broken_completions());
    let job = store.add_job(NewJob::new("ok", json!({}))).await.unwrap();
    let opts = options(&config(1, 20), store.clone());
    let mut events = opts.events.subscribe();
    let runner =
        Runner::start(opts, Arc::new(TaskList::new().with("ok", ok_task)), CronItems::default()).unwrap();

    let outcome = tokio::time::timeout(WAIT, runner.wait()).await.unwrap();
    let message = match outcome {
        Err(WorkerError::Fatal(message)) => message,
        other => panic!("expected fatal error, got {other:?}"),
    };
    assert!(message.starts_with(&format!("Failed to release job '{}' after success:", job.id)));
    assert!(!runner.is_running());

    let job_error = next_event(&mut events, |e| match e {
        WorkerEvent::WorkerFatalError { job_error, .. } => Some(job_error),
        _ => None,
    })
    .await;
    assert!(job_error.is_none());
}

#[tokio::test]
async fn run_once_drains_due_jobs() {
    let store = memory_store();
    for n in 0..4 {
        store.add_job(NewJob::new("ok", json!({ "n": n }))).await.unwrap();
    }
    let later = store
        .add_job(NewJob::new("ok", json!({})).with_run_at(Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();

    run_once(options(&config(2, 20), store.clone()), Arc::new(TaskList::new().with("ok", ok_task)))
        .await
        .unwrap();

    let details = store.intern_task_names(&["ok".to_string()]).await.unwrap();
    assert!(store.claim("inspector", &details.task_ids, &[]).await.unwrap().is_none());
    assert!(store.get_job(later.id).await.unwrap().is_some());
}

#[tokio::test]
async fn run_once_treats_claim_error_as_fatal() {
    let store = Arc::new(FaultyStore::broken_claims());
    let outcome =
        run_once(options(&config(1, 20), store), Arc::new(TaskList::new().with("ok", ok_task))).await;
    assert!(matches!(outcome, Err(WorkerError::Claim(_))));
}

#[tokio::test]
async fn forbidden_flags_are_skipped() {
    let store = memory_store();
    let flagged = store
        .add_job(NewJob::new("ok", json!({})).with_flags(["tenant:slow"]))
        .await
        .unwrap();
    let plain = store.add_job(NewJob::new("ok", json!({}))).await.unwrap();

    let opts = CompiledOptions::new(&config(1, 20), store.clone(), Arc::new(SystemClock))
        .unwrap()
        .with_forbidden_flags(ForbiddenFlags::Static(vec!["tenant:slow".into()]));
    run_once(Arc::new(opts), Arc::new(TaskList::new().with("ok", ok_task)))
        .await
        .unwrap();

    assert!(store.get_job(flagged.id).await.unwrap().is_some());
    assert!(store.get_job(plain.id).await.unwrap().is_none());
}

#[tokio::test]
async fn helpers_can_enqueue_follow_ups() {
    let store = memory_store();
    let chain = |payload: Value, helpers: JobHelpers| async move {
        let step = payload["step"].as_i64().unwrap_or(0);
        if step < 2 {
            helpers
                .add_job(NewJob::new("chain", json!({ "step": step + 1 })))
                .await?;
        }
        Ok::<_, anyhow::Error>(TaskOutput::Value(json!(step)))
    };
    store.add_job(NewJob::new("chain", json!({ "step": 0 }))).await.unwrap();

    run_once(options(&config(1, 20), store.clone()), Arc::new(TaskList::new().with("chain", chain)))
        .await
        .unwrap();

    let details = store.intern_task_names(&["chain".to_string()]).await.unwrap();
    assert!(store.claim("inspector", &details.task_ids, &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn sqlite_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let store = Arc::new(
        SqliteJobStore::open(path.to_str().unwrap(), "drover", 4)
            .await
            .unwrap(),
    );
    let ok = store.add_job(NewJob::new("ok", json!({}))).await.unwrap();
    let bad = store.add_job(NewJob::new("flaky", json!({}))).await.unwrap();

    let tasks = TaskList::new().with("ok", ok_task).with("flaky", failing_task);
    run_once(options(&config(2, 20), store.clone()), Arc::new(tasks))
        .await
        .unwrap();

    assert!(store.get_job(ok.id).await.unwrap().is_none());
    let bad = store.get_job(bad.id).await.unwrap().unwrap();
    assert_eq!(bad.attempts, 1);
    assert_eq!(bad.last_error.as_deref(), Some("upstream unavailable"));
}
