use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, DurationRound, Utc};
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use drover_core::NewJob;
use drover_cron::{ParsedCronItem, TimeDigest};

use crate::error::{Result, WorkerError};
use crate::events::WorkerEvent;
use crate::options::CompiledOptions;
use crate::worker::Completion;

/// Longest single sleep. The clock is re-read after every slice, so a
/// suspended host or an adjusted clock is noticed promptly.
const MAX_TIMER_SLICE: StdDuration = StdDuration::from_secs(1);

/// The cron items in force. Cloning shares the same set; `replace` swaps it
/// for the scheduler's next tick.
#[derive(Clone, Default)]
pub struct CronItems {
    inner: Arc<RwLock<Arc<Vec<ParsedCronItem>>>>,
}

impl CronItems {
    pub fn new(items: Vec<ParsedCronItem>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(items))),
        }
    }

    pub fn replace(&self, items: Vec<ParsedCronItem>) {
        let count = items.len();
        *self.inner.write().expect("cron items poisoned") = Arc::new(items);
        debug!(items = count, "cron items replaced");
    }

    pub fn current(&self) -> Arc<Vec<ParsedCronItem>> {
        self.inner.read().expect("cron items poisoned").clone()
    }
}

/// Enqueues a job for every cron item matching each wall-clock minute.
pub struct Cron {
    stop: watch::Sender<bool>,
    released: AtomicBool,
    completion: Completion,
}

impl Cron {
    /// Register identifiers, backfill missed minutes, then follow the clock.
    pub fn start(options: Arc<CompiledOptions>, items: CronItems) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_cron(options, items, stop_rx));
        let completion = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(WorkerError::Fatal(format!("cron scheduler aborted: {e}"))),
            }
        }
        .boxed()
        .shared();
        Self {
            stop,
            released: AtomicBool::new(false),
            completion,
        }
    }

    /// Stop scheduling. A firing already in progress finishes first.
    pub fn release(&self) -> Completion {
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!("cron scheduler releasing");
            let _ = self.stop.send(true);
        }
        self.completion.clone()
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

async fn run_cron(
    options: Arc<CompiledOptions>,
    items: CronItems,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let initial = items.current();
    let identifiers: Vec<String> = initial.iter().map(|i| i.identifier.clone()).collect();
    options.store.register_known_crontabs(&identifiers).await?;
    info!(items = initial.len(), "cron scheduler started");

    let start = options.clock.now();
    backfill(&options, &initial, start).await;

    let mut next = floor_minute(start) + Duration::minutes(1);
    loop {
        let now = options.clock.now();
        if next > now {
            let wait = (next - now).to_std().unwrap_or_default().min(MAX_TIMER_SLICE);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.changed() => return Ok(()),
            }
            if *stop.borrow() {
                return Ok(());
            }
            continue;
        }
        if now - next > Duration::minutes(1) {
            warn!(
                behind_secs = (now - next).num_seconds(),
                "cron is running behind; catching up on missed minutes"
            );
        }

        let current = items.current();
        let due: Vec<&ParsedCronItem> = current.iter().collect();
        fire(&options, &due, next, false).await;
        next += Duration::minutes(1);

        if *stop.borrow() {
            return Ok(());
        }
    }
}

/// Replay minutes each backfilling item missed while nothing was running.
///
/// A minute `ts` is replayed for an item when
/// `max(watermark, now - fill) < ts < now`, where the watermark is the last
/// execution, or first sight for an item that never ran.
async fn backfill(options: &CompiledOptions, items: &[ParsedCronItem], now: DateTime<Utc>) {
    let backfilling: Vec<&ParsedCronItem> = items
        .iter()
        .filter(|i| !i.options.backfill_period.is_zero())
        .collect();
    if backfilling.is_empty() {
        return;
    }

    let identifiers: Vec<String> = backfilling.iter().map(|i| i.identifier.clone()).collect();
    let known = match options.store.known_crontabs(&identifiers).await {
        Ok(known) => known,
        Err(e) => {
            error!(error = %e, "failed to read cron watermarks; skipping backfill");
            return;
        }
    };
    let watermarks: HashMap<&str, DateTime<Utc>> = known
        .iter()
        .map(|k| (k.identifier.as_str(), k.last_execution.unwrap_or(k.known_since)))
        .collect();

    let mut windows = Vec::new();
    for item in &backfilling {
        let Some(watermark) = watermarks.get(item.identifier.as_str()) else {
            continue;
        };
        let since = Duration::from_std(item.options.backfill_period)
            .ok()
            .and_then(|fill| now.checked_sub_signed(fill))
            .map_or(*watermark, |s| s.max(*watermark));
        windows.push((*item, since));
    }
    let Some(earliest) = windows.iter().map(|(_, since)| *since).min() else {
        return;
    };

    let mut ts = floor_minute(earliest) + Duration::minutes(1);
    let mut replayed = 0usize;
    while ts < now {
        let due: Vec<&ParsedCronItem> = windows
            .iter()
            .filter(|(_, since)| ts > *since)
            .map(|(item, _)| *item)
            .collect();
        replayed += fire(options, &due, ts, true).await;
        ts += Duration::minutes(1);
    }
    if replayed > 0 {
        info!(jobs = replayed, "cron backfill complete");
    }
}

/// Enqueue every item in `candidates` whose pattern matches `ts`. Returns
/// the number of jobs created. Per-item failures are logged and skipped.
async fn fire(
    options: &CompiledOptions,
    candidates: &[&ParsedCronItem],
    ts: DateTime<Utc>,
    backfilled: bool,
) -> usize {
    let digest = TimeDigest::from_datetime(&ts);
    let due: Vec<&ParsedCronItem> = candidates
        .iter()
        .copied()
        .filter(|item| item.pattern.matches(&digest))
        .collect();
    if due.is_empty() {
        return 0;
    }

    let identifiers = due.iter().map(|i| i.identifier.clone()).collect();
    options.events.emit(if backfilled {
        WorkerEvent::CronBackfill { ts, identifiers }
    } else {
        WorkerEvent::CronSchedule { ts, identifiers }
    });

    let mut created = 0;
    for item in due {
        let job = cron_job(item, ts, backfilled);
        match options.store.fire_cron_job(&item.identifier, ts, job).await {
            Ok(Some(job)) => {
                created += 1;
                debug!(identifier = %item.identifier, job_id = job.id, %ts, backfilled, "cron job enqueued");
            }
            Ok(None) => {
                debug!(identifier = %item.identifier, %ts, "cron minute already processed");
            }
            Err(e) => {
                error!(identifier = %item.identifier, %ts, error = %e, "failed to enqueue cron job");
            }
        }
    }
    created
}

/// The job a cron item enqueues for minute `ts`. Object payloads gain a
/// `_cron` entry describing the firing.
pub fn cron_job(item: &ParsedCronItem, ts: DateTime<Utc>, backfilled: bool) -> NewJob {
    let mut payload = item.payload.clone();
    if let Value::Object(map) = &mut payload {
        map.insert(
            "_cron".to_string(),
            json!({ "ts": ts.to_rfc3339(), "backfilled": backfilled }),
        );
    }

    let mut job = NewJob::new(item.task.clone(), payload).with_run_at(ts);
    if let Some(queue) = &item.options.queue_name {
        job = job.with_queue(queue.clone());
    }
    if let Some(max) = item.options.max_attempts {
        job = job.with_max_attempts(max);
    }
    if let Some(priority) = item.options.priority {
        job = job.with_priority(priority);
    }
    job
}

fn floor_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::minutes(1)).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::{Clock, DroverConfig, ManualClock};
    use drover_cron::{parse_crontab, CronItemOptions};
    use drover_store::{JobStore, MemoryJobStore};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn setup(now: &str) -> (Arc<CompiledOptions>, Arc<ManualClock>, Arc<MemoryJobStore>) {
        let clock = Arc::new(ManualClock::new(at(now)));
        let store = Arc::new(MemoryJobStore::new(clock.clone()));
        let options =
            CompiledOptions::new(&DroverConfig::default(), store.clone(), clock.clone()).unwrap();
        (Arc::new(options), clock, store)
    }

    async fn pending_jobs(store: &MemoryJobStore) -> Vec<drover_core::Job> {
        let details = store.intern_task_names(&["tick".to_string()]).await.unwrap();
        let mut jobs = Vec::new();
        while let Some(job) = store.claim("w", &details.task_ids, &[]).await.unwrap() {
            jobs.push(job);
        }
        jobs
    }

    #[test]
    fn cron_payload_annotated() {
        let items = parse_crontab("*/5 * * * * tick ?queue=q&max=3&priority=2 {a: 1}").unwrap();
        let ts = at("2024-05-01T10:05:00Z");
        let job = cron_job(&items[0], ts, true);
        assert_eq!(job.task_identifier, "tick");
        assert_eq!(job.queue_name.as_deref(), Some("q"));
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, 2);
        assert_eq!(job.run_at, Some(ts));
        assert_eq!(job.payload["a"], 1);
        assert_eq!(job.payload["_cron"]["backfilled"], true);
        assert_eq!(job.payload["_cron"]["ts"], ts.to_rfc3339());
    }

    #[test]
    fn non_object_payload_left_alone() {
        let mut items = parse_crontab("* * * * * tick").unwrap();
        items[0].payload = json!([1, 2]);
        let job = cron_job(&items[0], at("2024-05-01T10:05:00Z"), false);
        assert_eq!(job.payload, json!([1, 2]));
    }

    #[tokio::test]
    async fn backfill_replays_missed_minutes_once() {
        let (options, clock, store) = setup("2024-05-01T10:00:30Z");
        let items = parse_crontab("* * * * * tick ?fill=10m").unwrap();
        let ids = vec![items[0].identifier.clone()];
        store.register_known_crontabs(&ids).await.unwrap();
        // Last ran at 10:00, the process was down for five minutes.
        store
            .fire_cron_job("tick", at("2024-05-01T10:00:00Z"), cron_job(&items[0], at("2024-05-01T10:00:00Z"), false))
            .await
            .unwrap();
        let _ = pending_jobs(&store).await;

        clock.set(at("2024-05-01T10:05:30Z"));
        backfill(&options, &items, clock.now()).await;
        let jobs = pending_jobs(&store).await;
        let minutes: Vec<String> = jobs
            .iter()
            .map(|j| j.payload["_cron"]["ts"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(minutes.len(), 5, "{minutes:?}");
        assert!(jobs.iter().all(|j| j.payload["_cron"]["backfilled"] == true));

        backfill(&options, &items, clock.now()).await;
        assert!(pending_jobs(&store).await.is_empty());
    }

    #[tokio::test]
    async fn backfill_limited_to_fill_window() {
        let (options, clock, store) = setup("2024-05-01T00:00:00Z");
        let items = parse_crontab("* * * * * tick ?fill=3m").unwrap();
        store.register_known_crontabs(&["tick".to_string()]).await.unwrap();

        clock.set(at("2024-05-01T01:00:00Z"));
        backfill(&options, &items, clock.now()).await;
        // 00:58 and 00:59 lie strictly inside (now - 3m, now).
        assert_eq!(pending_jobs(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn items_without_fill_never_backfill() {
        let (options, clock, store) = setup("2024-05-01T00:00:00Z");
        let items = parse_crontab("* * * * * tick").unwrap();
        assert_eq!(items[0].options, CronItemOptions::default());
        store.register_known_crontabs(&["tick".to_string()]).await.unwrap();
        clock.set(at("2024-05-01T01:00:00Z"));
        backfill(&options, &items, clock.now()).await;
        assert!(pending_jobs(&store).await.is_empty());
    }

    #[tokio::test]
    async fn live_loop_fires_on_minute_boundary() {
        let (options, clock, store) = setup("2024-05-01T10:00:59Z");
        let items = CronItems::new(parse_crontab("* * * * * tick").unwrap());
        let mut events = options.events.subscribe();
        let cron = Cron::start(options.clone(), items);

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        clock.set(at("2024-05-01T10:01:00.500Z"));

        let ts = loop {
            match tokio::time::timeout(StdDuration::from_secs(5), events.recv()).await {
                Ok(Ok(WorkerEvent::CronSchedule { ts, identifiers })) => {
                    assert_eq!(identifiers, vec!["tick"]);
                    break ts;
                }
                Ok(Ok(_)) => continue,
                other => panic!("no schedule event: {other:?}"),
            }
        };
        assert_eq!(ts, at("2024-05-01T10:01:00Z"));

        cron.release().await.unwrap();
        let jobs = pending_jobs(&store).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload["_cron"]["backfilled"], false);
    }

    #[test]
    fn items_can_be_swapped() {
        let items = CronItems::new(Vec::new());
        let shared = items.clone();
        shared.replace(parse_crontab("0 4 * * * nightly").unwrap());
        assert_eq!(items.current().len(), 1);
    }
}
