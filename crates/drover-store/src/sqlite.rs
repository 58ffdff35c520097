use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tokio::task;
use tracing::{debug, info};

use drover_core::config::{DroverConfig, STALE_LOCK_AGE_MS};
use drover_core::{Clock, Job, JobKeyMode, JobQueue, KnownCrontab, NewJob};

use crate::{
    backoff::retry_at,
    cron_job_key,
    db::{init_db, Tables},
    error::{Result, StoreError},
    pool::ConnectionPool,
    validate_new_job, JobStore, ResetCounts, TaskDetails,
};

/// SQLite-backed [`JobStore`].
///
/// Every operation checks out a pooled connection and runs on the blocking
/// thread pool. Claims and cron firings take the write lock up front
/// (`BEGIN IMMEDIATE`) so concurrent workers serialise on the database rather
/// than racing on a read snapshot.
pub struct SqliteJobStore {
    pool: Arc<ConnectionPool>,
    tables: Arc<Tables>,
    /// Set when `use_local_time` is on; otherwise SQLite supplies "now".
    clock: Option<Arc<dyn Clock>>,
}

impl SqliteJobStore {
    /// Open (or create) the database at `path` and install the schema.
    pub async fn open(path: &str, schema: &str, max_pool_size: usize) -> Result<Self> {
        let tables = Tables::new(schema)?;
        let owned_path = path.to_string();
        let pool =
            task::spawn_blocking(move || ConnectionPool::open(&owned_path, max_pool_size)).await??;
        let store = Self {
            pool: Arc::new(pool),
            tables: Arc::new(tables),
            clock: None,
        };
        store.migrate().await?;
        info!(path, schema, "job store ready");
        Ok(store)
    }

    pub async fn from_config(config: &DroverConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Self::open(
            &config.database.path,
            &config.worker.schema,
            config.database.max_pool_size,
        )
        .await?;
        Ok(if config.worker.use_local_time {
            store.with_local_time(clock)
        } else {
            store
        })
    }

    /// Read "now" from `clock` instead of the database.
    pub fn with_local_time(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Create the queue tables if missing.
    pub async fn migrate(&self) -> Result<()> {
        self.with_conn(|conn, t, _| init_db(conn, t)).await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Tables, Option<i64>) -> Result<T> + Send + 'static,
    {
        let mut conn = self.pool.get().await?;
        let tables = Arc::clone(&self.tables);
        let local_now = self.clock.as_ref().map(|c| c.now().timestamp_millis());
        task::spawn_blocking(move || f(&mut *conn, &*tables, local_now)).await?
    }
}

fn now_ms(conn: &Connection, local_now: Option<i64>) -> Result<i64> {
    match local_now {
        Some(ms) => Ok(ms),
        None => Ok(conn.query_row(
            "SELECT CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)",
            [],
            |r| r.get(0),
        )?),
    }
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn job_select(t: &Tables) -> String {
    format!(
        "SELECT j.id, j.job_queue_id, q.queue_name, j.task_id, tk.identifier, j.payload,
                j.priority, j.run_at, j.attempts, j.max_attempts, j.last_error,
                j.locked_by, j.locked_at, j.flags, j.key, j.created_at, j.updated_at
         FROM {jobs} j
         JOIN {tasks} tk ON tk.id = j.task_id
         LEFT JOIN {queues} q ON q.id = j.job_queue_id",
        jobs = t.jobs,
        tasks = t.tasks,
        queues = t.job_queues,
    )
}

/// Raw column values; JSON columns are decoded in [`JobRow::into_job`] so
/// serde errors surface as [`StoreError::Serialization`].
struct JobRow {
    id: i64,
    job_queue_id: Option<i64>,
    queue_name: Option<String>,
    task_id: i64,
    task_identifier: String,
    payload: String,
    priority: i32,
    run_at: i64,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<i64>,
    flags: String,
    key: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_queue_id: row.get(1)?,
            queue_name: row.get(2)?,
            task_id: row.get(3)?,
            task_identifier: row.get(4)?,
            payload: row.get(5)?,
            priority: row.get(6)?,
            run_at: row.get(7)?,
            attempts: row.get(8)?,
            max_attempts: row.get(9)?,
            last_error: row.get(10)?,
            locked_by: row.get(11)?,
            locked_at: row.get(12)?,
            flags: row.get(13)?,
            key: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            job_queue_id: self.job_queue_id,
            queue_name: self.queue_name,
            task_id: self.task_id,
            task_identifier: self.task_identifier,
            payload: serde_json::from_str(&self.payload)?,
            priority: self.priority,
            run_at: from_ms(self.run_at),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            last_error: self.last_error,
            locked_by: self.locked_by,
            locked_at: self.locked_at.map(from_ms),
            flags: serde_json::from_str(&self.flags)?,
            key: self.key,
            created_at: from_ms(self.created_at),
            updated_at: from_ms(self.updated_at),
        })
    }
}

fn fetch_job(conn: &Connection, t: &Tables, id: i64) -> Result<Option<Job>> {
    conn.query_row(&format!("{} WHERE j.id = ?1", job_select(t)), [id], JobRow::read)
        .optional()?
        .map(JobRow::into_job)
        .transpose()
}

fn intern_task(conn: &Connection, t: &Tables, identifier: &str) -> Result<i64> {
    conn.execute(
        &format!("INSERT OR IGNORE INTO {} (identifier) VALUES (?1)", t.tasks),
        [identifier],
    )?;
    Ok(conn.query_row(
        &format!("SELECT id FROM {} WHERE identifier = ?1", t.tasks),
        [identifier],
        |r| r.get(0),
    )?)
}

fn intern_queue(conn: &Connection, t: &Tables, queue_name: &str) -> Result<i64> {
    conn.execute(
        &format!("INSERT OR IGNORE INTO {} (queue_name) VALUES (?1)", t.job_queues),
        [queue_name],
    )?;
    Ok(conn.query_row(
        &format!("SELECT id FROM {} WHERE queue_name = ?1", t.job_queues),
        [queue_name],
        |r| r.get(0),
    )?)
}

/// Insert (or key-merge) a job inside the caller's transaction; returns its id.
fn insert_job(conn: &Connection, t: &Tables, now: i64, job: &NewJob) -> Result<i64> {
    validate_new_job(job)?;
    let run_at = job.run_at.map_or(now, |d| d.timestamp_millis());
    let payload = serde_json::to_string(&job.payload)?;
    let flags = serde_json::to_string(&job.flags)?;

    if let Some(key) = &job.key {
        let existing: Option<(i64, Option<String>)> = conn
            .query_row(
                &format!("SELECT id, locked_by FROM {} WHERE key = ?1", t.jobs),
                [key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        match (existing, job.key_mode) {
            (Some((id, _)), JobKeyMode::Dedupe) => {
                debug!(job_id = id, key = %key, "job key exists, keeping existing job");
                return Ok(id);
            }
            (Some((id, None)), JobKeyMode::Replace) => {
                let task_id = intern_task(conn, t, &job.task_identifier)?;
                let queue_id = job
                    .queue_name
                    .as_deref()
                    .map(|q| intern_queue(conn, t, q))
                    .transpose()?;
                conn.execute(
                    &format!(
                        "UPDATE {} SET task_id = ?1, job_queue_id = ?2, payload = ?3,
                             priority = ?4, run_at = ?5, max_attempts = ?6, flags = ?7,
                             attempts = 0, last_error = NULL, updated_at = ?8
                         WHERE id = ?9",
                        t.jobs
                    ),
                    params![
                        task_id,
                        queue_id,
                        payload,
                        job.priority,
                        run_at,
                        job.max_attempts,
                        flags,
                        now,
                        id
                    ],
                )?;
                debug!(job_id = id, key = %key, "job replaced by key");
                return Ok(id);
            }
            (Some((id, Some(_))), JobKeyMode::Replace) => {
                // The keyed job is running: detach its key and stop it from
                // retrying, then insert the replacement below.
                conn.execute(
                    &format!(
                        "UPDATE {} SET key = NULL, attempts = max_attempts, updated_at = ?1
                         WHERE id = ?2",
                        t.jobs
                    ),
                    params![now, id],
                )?;
            }
            (None, _) => {}
        }
    }

    let task_id = intern_task(conn, t, &job.task_identifier)?;
    let queue_id = job
        .queue_name
        .as_deref()
        .map(|q| intern_queue(conn, t, q))
        .transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO {}
             (job_queue_id, task_id, payload, priority, run_at, attempts, max_attempts,
              key, flags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?9)",
            t.jobs
        ),
        params![
            queue_id,
            task_id,
            payload,
            job.priority,
            run_at,
            job.max_attempts,
            job.key,
            flags,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn release_queue(conn: &Connection, t: &Tables, queue_id: i64, worker_id: &str) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {} SET locked_by = NULL, locked_at = NULL
             WHERE id = ?1 AND locked_by = ?2",
            t.job_queues
        ),
        params![queue_id, worker_id],
    )?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn add_job(&self, job: NewJob) -> Result<Job> {
        self.with_conn(move |conn, t, local_now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms(&tx, local_now)?;
            let id = insert_job(&tx, t, now, &job)?;
            let added = fetch_job(&tx, t, id)?
                .ok_or_else(|| StoreError::InvalidJob(format!("job {id} vanished after insert")))?;
            tx.commit()?;
            info!(
                job_id = added.id,
                task = %added.task_identifier,
                queue = added.queue_name.as_deref().unwrap_or(""),
                "job added"
            );
            Ok(added)
        })
        .await
    }

    async fn claim(
        &self,
        worker_id: &str,
        task_ids: &[i64],
        excluded_flags: &[String],
    ) -> Result<Option<Job>> {
        if task_ids.is_empty() {
            return Ok(None);
        }
        let worker_id = worker_id.to_string();
        let task_ids = serde_json::to_string(task_ids)?;
        let excluded = serde_json::to_string(excluded_flags)?;

        self.with_conn(move |conn, t, local_now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms(&tx, local_now)?;
            let stale = now - STALE_LOCK_AGE_MS;

            let candidate: Option<(i64, Option<i64>)> = tx
                .query_row(
                    &format!(
                        "SELECT j.id, j.job_queue_id
                         FROM {jobs} j
                         LEFT JOIN {queues} q ON q.id = j.job_queue_id
                         WHERE j.run_at <= :now
                           AND (j.locked_at IS NULL OR j.locked_at < :stale)
                           AND j.attempts < j.max_attempts
                           AND j.task_id IN (SELECT value FROM json_each(:task_ids))
                           AND NOT EXISTS (
                               SELECT 1 FROM json_each(j.flags) f
                               WHERE f.value IN (SELECT value FROM json_each(:excluded))
                           )
                           AND (j.job_queue_id IS NULL OR q.locked_at IS NULL OR q.locked_at < :stale)
                         ORDER BY j.priority, j.run_at, j.id
                         LIMIT 1",
                        jobs = t.jobs,
                        queues = t.job_queues,
                    ),
                    named_params! {
                        ":now": now,
                        ":stale": stale,
                        ":task_ids": task_ids,
                        ":excluded": excluded,
                    },
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let Some((job_id, queue_id)) = candidate else {
                tx.commit()?;
                return Ok(None);
            };

            tx.execute(
                &format!(
                    "UPDATE {} SET attempts = attempts + 1, locked_by = ?1, locked_at = ?2,
                         updated_at = ?2
                     WHERE id = ?3",
                    t.jobs
                ),
                params![worker_id, now, job_id],
            )?;
            if let Some(queue_id) = queue_id {
                tx.execute(
                    &format!(
                        "UPDATE {} SET locked_by = ?1, locked_at = ?2 WHERE id = ?3",
                        t.job_queues
                    ),
                    params![worker_id, now, queue_id],
                )?;
            }
            let job = fetch_job(&tx, t, job_id)?;
            tx.commit()?;
            Ok(job)
        })
        .await
    }

    async fn complete(&self, worker_id: &str, job: &Job) -> Result<()> {
        let worker_id = worker_id.to_string();
        let job_id = job.id;
        let known_queue = job.job_queue_id;

        self.with_conn(move |conn, t, _| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let queue_id = tx
                .query_row(
                    &format!("SELECT job_queue_id FROM {} WHERE id = ?1", t.jobs),
                    [job_id],
                    |r| r.get::<_, Option<i64>>(0),
                )
                .optional()?
                .flatten()
                .or(known_queue);

            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", t.jobs), [job_id])?;
            if let Some(queue_id) = queue_id {
                release_queue(&tx, t, queue_id, &worker_id)?;
                let removed = tx.execute(
                    &format!(
                        "DELETE FROM {queues} WHERE id = ?1 AND locked_by IS NULL
                           AND NOT EXISTS (SELECT 1 FROM {jobs} WHERE job_queue_id = ?1)",
                        queues = t.job_queues,
                        jobs = t.jobs,
                    ),
                    [queue_id],
                )?;
                if removed > 0 {
                    debug!(queue_id, "empty job queue removed");
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn fail(
        &self,
        worker_id: &str,
        job: &Job,
        message: &str,
        replacement_payload: Option<Value>,
    ) -> Result<()> {
        let worker_id = worker_id.to_string();
        let job_id = job.id;
        let message = message.to_string();
        let replacement = replacement_payload
            .map(|p| serde_json::to_string(&p))
            .transpose()?;

        self.with_conn(move |conn, t, local_now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms(&tx, local_now)?;
            let locked: Option<(i64, i32, Option<i64>)> = tx
                .query_row(
                    &format!(
                        "SELECT run_at, attempts, job_queue_id FROM {}
                         WHERE id = ?1 AND locked_by = ?2",
                        t.jobs
                    ),
                    params![job_id, worker_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;

            let Some((run_at, attempts, queue_id)) = locked else {
                debug!(job_id, worker_id = %worker_id, "job not locked by this worker, fail skipped");
                tx.commit()?;
                return Ok(());
            };

            let next_run = retry_at(from_ms(now), from_ms(run_at), attempts).timestamp_millis();
            tx.execute(
                &format!(
                    "UPDATE {} SET last_error = ?1, run_at = ?2, locked_by = NULL,
                         locked_at = NULL, payload = COALESCE(?3, payload), updated_at = ?4
                     WHERE id = ?5 AND locked_by = ?6",
                    t.jobs
                ),
                params![message, next_run, replacement, now, job_id, worker_id],
            )?;
            if let Some(queue_id) = queue_id {
                release_queue(&tx, t, queue_id, &worker_id)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn reset_stale_locks(&self) -> Result<ResetCounts> {
        self.with_conn(|conn, t, local_now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let threshold = now_ms(&tx, local_now)? - STALE_LOCK_AGE_MS;
            let jobs = tx.execute(
                &format!(
                    "UPDATE {} SET locked_by = NULL, locked_at = NULL WHERE locked_at < ?1",
                    t.jobs
                ),
                [threshold],
            )?;
            let queues = tx.execute(
                &format!(
                    "UPDATE {} SET locked_by = NULL, locked_at = NULL WHERE locked_at < ?1",
                    t.job_queues
                ),
                [threshold],
            )?;
            tx.commit()?;
            Ok(ResetCounts { jobs, queues })
        })
        .await
    }

    async fn intern_task_names(&self, names: &[String]) -> Result<TaskDetails> {
        let names = names.to_vec();
        self.with_conn(move |conn, t, _| {
            let tx = conn.transaction()?;
            for name in &names {
                tx.execute(
                    &format!("INSERT OR IGNORE INTO {} (identifier) VALUES (?1)", t.tasks),
                    [name],
                )?;
            }
            let mut identifiers = HashMap::new();
            {
                let mut stmt = tx.prepare(&format!(
                    "SELECT id, identifier FROM {}
                     WHERE identifier IN (SELECT value FROM json_each(?1))",
                    t.tasks
                ))?;
                let rows = stmt.query_map([serde_json::to_string(&names)?], |r| {
                    Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (id, identifier) = row?;
                    identifiers.insert(id, identifier);
                }
            }
            tx.commit()?;

            if let Some(missing) = names
                .iter()
                .find(|n| !identifiers.values().any(|v| v == *n))
            {
                return Err(StoreError::UnknownTask(missing.clone()));
            }
            let mut task_ids: Vec<i64> = identifiers.keys().copied().collect();
            task_ids.sort_unstable();
            Ok(TaskDetails {
                task_ids,
                identifiers,
            })
        })
        .await
    }

    async fn register_known_crontabs(&self, identifiers: &[String]) -> Result<()> {
        let identifiers = identifiers.to_vec();
        self.with_conn(move |conn, t, local_now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms(&tx, local_now)?;
            for identifier in &identifiers {
                tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO {} (identifier, known_since) VALUES (?1, ?2)",
                        t.known_crontabs
                    ),
                    params![identifier, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn known_crontabs(&self, identifiers: &[String]) -> Result<Vec<KnownCrontab>> {
        let filter = serde_json::to_string(identifiers)?;
        self.with_conn(move |conn, t, _| {
            let mut stmt = conn.prepare(&format!(
                "SELECT identifier, known_since, last_execution FROM {}
                 WHERE identifier IN (SELECT value FROM json_each(?1))
                 ORDER BY identifier",
                t.known_crontabs
            ))?;
            let rows = stmt.query_map([filter], |r| {
                Ok(KnownCrontab {
                    identifier: r.get(0)?,
                    known_since: from_ms(r.get(1)?),
                    last_execution: r.get::<_, Option<i64>>(2)?.map(from_ms),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn fire_cron_job(
        &self,
        identifier: &str,
        ts: DateTime<Utc>,
        job: NewJob,
    ) -> Result<Option<Job>> {
        let identifier = identifier.to_string();
        let ts_ms = ts.timestamp_millis();
        let job = job.with_key(cron_job_key(&identifier, ts), JobKeyMode::Dedupe);

        self.with_conn(move |conn, t, local_now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms(&tx, local_now)?;
            let advanced = tx.execute(
                &format!(
                    "UPDATE {} SET last_execution = ?1
                     WHERE identifier = ?2 AND (last_execution IS NULL OR last_execution < ?1)",
                    t.known_crontabs
                ),
                params![ts_ms, identifier],
            )?;
            if advanced == 0 {
                let known: bool = tx.query_row(
                    &format!(
                        "SELECT EXISTS (SELECT 1 FROM {} WHERE identifier = ?1)",
                        t.known_crontabs
                    ),
                    [&identifier],
                    |r| r.get(0),
                )?;
                if known {
                    tx.commit()?;
                    return Ok(None);
                }
                tx.execute(
                    &format!(
                        "INSERT INTO {} (identifier, known_since, last_execution)
                         VALUES (?1, ?2, ?3)",
                        t.known_crontabs
                    ),
                    params![identifier, now, ts_ms],
                )?;
            }
            let id = insert_job(&tx, t, now, &job)?;
            let fired = fetch_job(&tx, t, id)?;
            tx.commit()?;
            Ok(fired)
        })
        .await
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        self.with_conn(move |conn, t, _| fetch_job(conn, t, id)).await
    }

    async fn job_queues(&self) -> Result<Vec<JobQueue>> {
        self.with_conn(|conn, t, _| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, queue_name, locked_by, locked_at FROM {} ORDER BY id",
                t.job_queues
            ))?;
            let rows = stmt.query_map([], |r| {
                Ok(JobQueue {
                    id: r.get(0)?,
                    queue_name: r.get(1)?,
                    locked_by: r.get(2)?,
                    locked_at: r.get::<_, Option<i64>>(3)?.map(from_ms),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}
