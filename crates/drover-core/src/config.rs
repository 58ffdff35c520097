use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, Result};

// Defaults shared by the config file, the CLI and programmatic callers.
pub const DEFAULT_SCHEMA: &str = "drover";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_MAX_CONTIGUOUS_ERRORS: u32 = 10;
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;
pub const DEFAULT_MIN_RESET_LOCKED_INTERVAL_MS: u64 = 8 * 60 * 1000; // 8 minutes
pub const DEFAULT_MAX_RESET_LOCKED_INTERVAL_MS: u64 = 10 * 60 * 1000; // 10 minutes
pub const DEFAULT_MAX_ATTEMPTS: i32 = 25;
/// A lock older than this is presumed orphaned by a dead worker.
pub const STALE_LOCK_AGE_MS: i64 = 4 * 60 * 60 * 1000; // 4 hours

/// Top-level config (drover.toml + DROVER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DroverConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub cron: CronConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:` for a throwaway database.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Upper bound on open store connections. Should exceed `worker.concurrency`
    /// so the scheduler and maintenance calls are not starved.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Namespace for the queue tables (`<schema>_jobs`, `<schema>_job_queues`, ...).
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Consecutive claim failures tolerated before a worker gives up.
    #[serde(default = "default_max_contiguous_errors")]
    pub max_contiguous_errors: u32,
    #[serde(default = "default_min_reset_locked_interval_ms")]
    pub min_reset_locked_interval_ms: u64,
    #[serde(default = "default_max_reset_locked_interval_ms")]
    pub max_reset_locked_interval_ms: u64,
    /// Read "now" from the process clock instead of the database clock.
    #[serde(default)]
    pub use_local_time: bool,
    /// Jobs carrying any of these flags are never claimed by this process.
    #[serde(default)]
    pub forbidden_flags: Vec<String>,
    /// Emit an info line for every successful job.
    #[serde(default = "bool_true")]
    pub log_success: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            concurrency: DEFAULT_CONCURRENCY,
            max_contiguous_errors: DEFAULT_MAX_CONTIGUOUS_ERRORS,
            min_reset_locked_interval_ms: DEFAULT_MIN_RESET_LOCKED_INTERVAL_MS,
            max_reset_locked_interval_ms: DEFAULT_MAX_RESET_LOCKED_INTERVAL_MS,
            use_local_time: false,
            forbidden_flags: Vec::new(),
            log_success: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    /// Crontab file to load. A missing file disables cron.
    #[serde(default)]
    pub crontab_path: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}
fn default_max_contiguous_errors() -> u32 {
    DEFAULT_MAX_CONTIGUOUS_ERRORS
}
fn default_min_reset_locked_interval_ms() -> u64 {
    DEFAULT_MIN_RESET_LOCKED_INTERVAL_MS
}
fn default_max_reset_locked_interval_ms() -> u64 {
    DEFAULT_MAX_RESET_LOCKED_INTERVAL_MS
}
fn default_max_pool_size() -> usize {
    DEFAULT_MAX_POOL_SIZE
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.drover/drover.db", home)
}

impl DroverConfig {
    /// Load config from a TOML file with DROVER_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `DROVER_WORKER__POLL_INTERVAL_MS=500`. A missing file is not an error;
    /// every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: DroverConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("DROVER_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory or out-of-range settings.
    pub fn validate(&self) -> Result<()> {
        let w = &self.worker;
        if !is_valid_schema_name(&w.schema) {
            return Err(CoreError::Config(format!(
                "invalid schema name '{}': expected letters, digits and underscores",
                w.schema
            )));
        }
        if w.concurrency == 0 {
            return Err(CoreError::Config("worker.concurrency must be at least 1".into()));
        }
        if w.poll_interval_ms == 0 {
            return Err(CoreError::Config("worker.poll_interval_ms must be at least 1".into()));
        }
        if w.max_contiguous_errors == 0 {
            return Err(CoreError::Config(
                "worker.max_contiguous_errors must be at least 1".into(),
            ));
        }
        if w.min_reset_locked_interval_ms < 1
            || w.max_reset_locked_interval_ms < w.min_reset_locked_interval_ms
        {
            return Err(CoreError::Config(format!(
                "invalid values for min_reset_locked_interval_ms ({}) / max_reset_locked_interval_ms ({})",
                w.min_reset_locked_interval_ms, w.max_reset_locked_interval_ms
            )));
        }
        if self.database.max_pool_size == 0 {
            return Err(CoreError::Config("database.max_pool_size must be at least 1".into()));
        }
        if self.database.max_pool_size < w.concurrency {
            warn!(
                max_pool_size = self.database.max_pool_size,
                concurrency = w.concurrency,
                "max_pool_size smaller than concurrency may lead to non-optimal performance"
            );
        }
        Ok(())
    }
}

/// Schema names are spliced into SQL as table prefixes, so only plain
/// identifiers are accepted.
pub fn is_valid_schema_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.drover/drover.toml", home)
}
