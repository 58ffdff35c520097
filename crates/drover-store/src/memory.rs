use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;

use drover_core::config::STALE_LOCK_AGE_MS;
use drover_core::{Clock, Job, JobKeyMode, JobQueue, KnownCrontab, NewJob};

use crate::{
    backoff::retry_at, cron_job_key, error::Result, validate_new_job, JobStore, ResetCounts,
    TaskDetails,
};

/// In-process [`JobStore`] with the same semantics as the SQLite store.
///
/// All state sits behind one mutex, which makes every operation atomic. Time
/// always comes from the injected clock.
pub struct MemoryJobStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<i64, Job>,
    queues: BTreeMap<i64, JobQueue>,
    tasks: BTreeMap<String, i64>,
    known: BTreeMap<String, KnownCrontab>,
    last_job_id: i64,
    last_queue_id: i64,
    last_task_id: i64,
}

impl State {
    fn intern_task(&mut self, identifier: &str) -> i64 {
        if let Some(id) = self.tasks.get(identifier) {
            return *id;
        }
        self.last_task_id += 1;
        self.tasks.insert(identifier.to_string(), self.last_task_id);
        self.last_task_id
    }

    fn intern_queue(&mut self, queue_name: &str) -> i64 {
        if let Some(q) = self.queues.values().find(|q| q.queue_name == queue_name) {
            return q.id;
        }
        self.last_queue_id += 1;
        let id = self.last_queue_id;
        self.queues.insert(
            id,
            JobQueue {
                id,
                queue_name: queue_name.to_string(),
                locked_by: None,
                locked_at: None,
            },
        );
        id
    }

    fn insert_job(&mut self, now: DateTime<Utc>, new: &NewJob) -> Result<i64> {
        validate_new_job(new)?;
        let run_at = new.run_at.unwrap_or(now);

        if let Some(key) = &new.key {
            let existing = self
                .jobs
                .values()
                .find(|j| j.key.as_deref() == Some(key.as_str()))
                .map(|j| (j.id, j.is_locked()));
            match (existing, new.key_mode) {
                (Some((id, _)), JobKeyMode::Dedupe) => {
                    debug!(job_id = id, key = %key, "job key exists, keeping existing job");
                    return Ok(id);
                }
                (Some((id, false)), JobKeyMode::Replace) => {
                    let task_id = self.intern_task(&new.task_identifier);
                    let queue = new.queue_name.as_deref().map(|q| (self.intern_queue(q), q));
                    if let Some(job) = self.jobs.get_mut(&id) {
                        job.task_id = task_id;
                        job.task_identifier = new.task_identifier.clone();
                        job.job_queue_id = queue.map(|(qid, _)| qid);
                        job.queue_name = queue.map(|(_, name)| name.to_string());
                        job.payload = new.payload.clone();
                        job.priority = new.priority;
                        job.run_at = run_at;
                        job.max_attempts = new.max_attempts;
                        job.flags = new.flags.clone();
                        job.attempts = 0;
                        job.last_error = None;
                        job.updated_at = now;
                    }
                    return Ok(id);
                }
                (Some((id, true)), JobKeyMode::Replace) => {
                    if let Some(job) = self.jobs.get_mut(&id) {
                        job.key = None;
                        job.attempts = job.max_attempts;
                        job.updated_at = now;
                    }
                }
                (None, _) => {}
            }
        }

        let task_id = self.intern_task(&new.task_identifier);
        let job_queue_id = new.queue_name.as_deref().map(|q| self.intern_queue(q));
        self.last_job_id += 1;
        let id = self.last_job_id;
        self.jobs.insert(
            id,
            Job {
                id,
                job_queue_id,
                queue_name: new.queue_name.clone(),
                task_id,
                task_identifier: new.task_identifier.clone(),
                payload: new.payload.clone(),
                priority: new.priority,
                run_at,
                attempts: 0,
                max_attempts: new.max_attempts,
                last_error: None,
                locked_by: None,
                locked_at: None,
                flags: new.flags.clone(),
                key: new.key.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    fn release_queue(&mut self, queue_id: i64, worker_id: &str) {
        if let Some(q) = self.queues.get_mut(&queue_id) {
            if q.locked_by.as_deref() == Some(worker_id) {
                q.locked_by = None;
                q.locked_at = None;
            }
        }
    }
}

impl MemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("job store poisoned")
    }
}

fn is_stale(locked_at: Option<DateTime<Utc>>, stale_before: DateTime<Utc>) -> bool {
    matches!(locked_at, Some(at) if at < stale_before)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add_job(&self, job: NewJob) -> Result<Job> {
        let now = self.clock.now();
        let mut state = self.state();
        let id = state.insert_job(now, &job)?;
        Ok(state.jobs[&id].clone())
    }

    async fn claim(
        &self,
        worker_id: &str,
        task_ids: &[i64],
        excluded_flags: &[String],
    ) -> Result<Option<Job>> {
        let now = self.clock.now();
        let stale_before = now - Duration::milliseconds(STALE_LOCK_AGE_MS);
        let mut state = self.state();

        let candidate = state
            .jobs
            .values()
            .filter(|j| j.run_at <= now)
            .filter(|j| j.locked_at.is_none() || is_stale(j.locked_at, stale_before))
            .filter(|j| j.attempts < j.max_attempts)
            .filter(|j| task_ids.contains(&j.task_id))
            .filter(|j| !excluded_flags.iter().any(|f| j.flags.contains(f)))
            .filter(|j| match j.job_queue_id.and_then(|qid| state.queues.get(&qid)) {
                None => true,
                Some(q) => q.locked_at.is_none() || is_stale(q.locked_at, stale_before),
            })
            .min_by_key(|j| (j.priority, j.run_at, j.id))
            .map(|j| (j.id, j.job_queue_id));

        let Some((job_id, queue_id)) = candidate else {
            return Ok(None);
        };
        if let Some(qid) = queue_id {
            if let Some(q) = state.queues.get_mut(&qid) {
                q.locked_by = Some(worker_id.to_string());
                q.locked_at = Some(now);
            }
        }
        let job = state
            .jobs
            .get_mut(&job_id)
            .map(|job| {
                job.attempts += 1;
                job.locked_by = Some(worker_id.to_string());
                job.locked_at = Some(now);
                job.updated_at = now;
                job.clone()
            });
        Ok(job)
    }

    async fn complete(&self, worker_id: &str, job: &Job) -> Result<()> {
        let mut state = self.state();
        let queue_id = state
            .jobs
            .remove(&job.id)
            .and_then(|j| j.job_queue_id)
            .or(job.job_queue_id);
        if let Some(qid) = queue_id {
            state.release_queue(qid, worker_id);
            let unlocked = state.queues.get(&qid).is_some_and(|q| q.locked_by.is_none());
            let in_use = state.jobs.values().any(|j| j.job_queue_id == Some(qid));
            if unlocked && !in_use {
                state.queues.remove(&qid);
                debug!(queue_id = qid, "empty job queue removed");
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        worker_id: &str,
        job: &Job,
        message: &str,
        replacement_payload: Option<Value>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state();
        let Some(stored) = state
            .jobs
            .get_mut(&job.id)
            .filter(|j| j.locked_by.as_deref() == Some(worker_id))
        else {
            debug!(job_id = job.id, worker_id, "job not locked by this worker, fail skipped");
            return Ok(());
        };

        stored.last_error = Some(message.to_string());
        stored.run_at = retry_at(now, stored.run_at, stored.attempts);
        stored.locked_by = None;
        stored.locked_at = None;
        stored.updated_at = now;
        if let Some(payload) = replacement_payload {
            stored.payload = payload;
        }
        let queue_id = stored.job_queue_id;
        if let Some(qid) = queue_id {
            state.release_queue(qid, worker_id);
        }
        Ok(())
    }

    async fn reset_stale_locks(&self) -> Result<ResetCounts> {
        let stale_before = self.clock.now() - Duration::milliseconds(STALE_LOCK_AGE_MS);
        let mut state = self.state();
        let mut counts = ResetCounts::default();
        for job in state.jobs.values_mut() {
            if is_stale(job.locked_at, stale_before) {
                job.locked_at = None;
                job.locked_by = None;
                counts.jobs += 1;
            }
        }
        for queue in state.queues.values_mut() {
            if is_stale(queue.locked_at, stale_before) {
                queue.locked_at = None;
                queue.locked_by = None;
                counts.queues += 1;
            }
        }
        Ok(counts)
    }

    async fn intern_task_names(&self, names: &[String]) -> Result<TaskDetails> {
        let mut state = self.state();
        let mut identifiers = HashMap::new();
        for name in names {
            identifiers.insert(state.intern_task(name), name.clone());
        }
        let mut task_ids: Vec<i64> = identifiers.keys().copied().collect();
        task_ids.sort_unstable();
        Ok(TaskDetails {
            task_ids,
            identifiers,
        })
    }

    async fn register_known_crontabs(&self, identifiers: &[String]) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state();
        for identifier in identifiers {
            state
                .known
                .entry(identifier.clone())
                .or_insert_with(|| KnownCrontab {
                    identifier: identifier.clone(),
                    known_since: now,
                    last_execution: None,
                });
        }
        Ok(())
    }

    async fn known_crontabs(&self, identifiers: &[String]) -> Result<Vec<KnownCrontab>> {
        let state = self.state();
        Ok(state
            .known
            .values()
            .filter(|k| identifiers.contains(&k.identifier))
            .cloned()
            .collect())
    }

    async fn fire_cron_job(
        &self,
        identifier: &str,
        ts: DateTime<Utc>,
        job: NewJob,
    ) -> Result<Option<Job>> {
        let now = self.clock.now();
        let job = job.with_key(cron_job_key(identifier, ts), JobKeyMode::Dedupe);
        let mut state = self.state();
        let known = state
            .known
            .entry(identifier.to_string())
            .or_insert_with(|| KnownCrontab {
                identifier: identifier.to_string(),
                known_since: now,
                last_execution: None,
            });
        if known.last_execution.is_some_and(|last| last >= ts) {
            return Ok(None);
        }
        let previous = known.last_execution.replace(ts);

        match state.insert_job(now, &job) {
            Ok(id) => Ok(Some(state.jobs[&id].clone())),
            Err(e) => {
                // Keep the watermark and the insert all-or-nothing.
                if let Some(k) = state.known.get_mut(identifier) {
                    k.last_execution = previous;
                }
                Err(e)
            }
        }
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        Ok(self.state().jobs.get(&id).cloned())
    }

    async fn job_queues(&self) -> Result<Vec<JobQueue>> {
        Ok(self.state().queues.values().cloned().collect())
    }
}
