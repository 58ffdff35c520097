use rusqlite::Connection;

use drover_core::config::is_valid_schema_name;

use crate::error::{Result, StoreError};

/// Fully qualified table names for one schema prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    pub jobs: String,
    pub job_queues: String,
    pub tasks: String,
    pub known_crontabs: String,
}

impl Tables {
    pub fn new(schema: &str) -> Result<Self> {
        if !is_valid_schema_name(schema) {
            return Err(StoreError::Config(format!(
                "invalid schema name '{schema}': expected letters, digits and underscores"
            )));
        }
        Ok(Self {
            jobs: format!("{schema}_jobs"),
            job_queues: format!("{schema}_job_queues"),
            tasks: format!("{schema}_tasks"),
            known_crontabs: format!("{schema}_known_crontabs"),
        })
    }
}

/// Initialise the queue schema in `conn`. Idempotent.
///
/// Timestamps are stored as INTEGER unix milliseconds; `flags` is a JSON
/// array of strings.
pub fn init_db(conn: &Connection, t: &Tables) -> Result<()> {
    let Tables {
        jobs,
        job_queues,
        tasks,
        known_crontabs,
    } = t;
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {job_queues} (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_name  TEXT    NOT NULL UNIQUE,
            locked_at   INTEGER,
            locked_by   TEXT,
            CHECK ((locked_by IS NULL) = (locked_at IS NULL))
        );

        CREATE TABLE IF NOT EXISTS {tasks} (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            identifier  TEXT    NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS {jobs} (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            job_queue_id  INTEGER REFERENCES {job_queues} (id),
            task_id       INTEGER NOT NULL REFERENCES {tasks} (id),
            payload       TEXT    NOT NULL DEFAULT '{{}}',
            priority      INTEGER NOT NULL DEFAULT 0,
            run_at        INTEGER NOT NULL,
            attempts      INTEGER NOT NULL DEFAULT 0,
            max_attempts  INTEGER NOT NULL DEFAULT 25 CHECK (max_attempts >= 1),
            last_error    TEXT,
            key           TEXT    UNIQUE CHECK (length(key) > 0),
            locked_at     INTEGER,
            locked_by     TEXT,
            flags         TEXT    NOT NULL DEFAULT '[]',
            created_at    INTEGER NOT NULL,
            updated_at    INTEGER NOT NULL,
            CHECK ((locked_by IS NULL) = (locked_at IS NULL))
        );

        -- Claim order: SELECT ... ORDER BY priority, run_at, id
        CREATE INDEX IF NOT EXISTS {jobs}_priority_run_at_id_idx
            ON {jobs} (priority, run_at, id);
        CREATE INDEX IF NOT EXISTS {jobs}_job_queue_id_idx ON {jobs} (job_queue_id);
        CREATE INDEX IF NOT EXISTS {jobs}_locked_at_idx ON {jobs} (locked_at);

        CREATE TABLE IF NOT EXISTS {known_crontabs} (
            identifier      TEXT    NOT NULL PRIMARY KEY,
            known_since     INTEGER NOT NULL,
            last_execution  INTEGER
        );
        "
    ))?;
    Ok(())
}
