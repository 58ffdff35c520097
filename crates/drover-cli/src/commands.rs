use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde_json::Value;
use tracing::info;

use drover_core::{DroverConfig, JobKeyMode, NewJob, SystemClock};
use drover_cron::{load_crontab_file, ParsedCronItem};
use drover_store::{JobStore, SqliteJobStore};

#[derive(Args, Debug)]
pub struct AddJobArgs {
    /// Task identifier
    pub task: String,
    /// Payload as JSON5 (defaults to `{}`)
    #[arg(short, long)]
    pub payload: Option<String>,
    /// Serial queue name
    #[arg(short, long)]
    pub queue: Option<String>,
    /// Earliest run time, RFC 3339
    #[arg(long)]
    pub run_at: Option<String>,
    #[arg(long)]
    pub max_attempts: Option<i32>,
    #[arg(long)]
    pub priority: Option<i32>,
    /// Job key for deduplication / replacement
    #[arg(long)]
    pub key: Option<String>,
    /// `replace` or `dedupe`
    #[arg(long, default_value = "replace")]
    pub key_mode: String,
    /// Flag for forbidden-flag filtering; repeatable
    #[arg(long = "flag")]
    pub flags: Vec<String>,
}

async fn open_store(config: &DroverConfig) -> Result<SqliteJobStore> {
    ensure_parent_dir(&config.database.path)?;
    let store = SqliteJobStore::from_config(config, Arc::new(SystemClock))
        .await
        .with_context(|| format!("opening job store at {}", config.database.path))?;
    Ok(store)
}

pub async fn migrate(config: &DroverConfig) -> Result<()> {
    let store = open_store(config).await?;
    store.migrate().await?;
    println!(
        "schema '{}' ready in {}",
        config.worker.schema, config.database.path
    );
    Ok(())
}

pub fn check_crontab(config: &DroverConfig, path: Option<&str>) -> Result<()> {
    let Some(path) = path.or(config.cron.crontab_path.as_deref()) else {
        bail!("no crontab given and cron.crontab_path is not configured");
    };
    let items = load_crontab_file(Path::new(path))?;
    if items.is_empty() {
        println!("{path}: no cron items");
        return Ok(());
    }
    for item in &items {
        println!("{}", describe(item));
    }
    println!("{path}: {} cron item(s) OK", items.len());
    Ok(())
}

fn describe(item: &ParsedCronItem) -> String {
    let mut line = format!("{} -> {}", item.identifier, item.task);
    let o = &item.options;
    if !o.backfill_period.is_zero() {
        line.push_str(&format!(" fill={}s", o.backfill_period.as_secs()));
    }
    if let Some(queue) = &o.queue_name {
        line.push_str(&format!(" queue={queue}"));
    }
    if let Some(max) = o.max_attempts {
        line.push_str(&format!(" max={max}"));
    }
    if let Some(priority) = o.priority {
        line.push_str(&format!(" priority={priority}"));
    }
    line.push_str(&format!(" payload={}", item.payload));
    line
}

pub async fn add_job(config: &DroverConfig, args: AddJobArgs) -> Result<()> {
    let job = build_job(args)?;
    let store = open_store(config).await?;
    let job = store.add_job(job).await?;
    info!(job_id = job.id, task = %job.task_identifier, "job added");
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

fn build_job(args: AddJobArgs) -> Result<NewJob> {
    let payload: Value = match &args.payload {
        Some(text) => json5::from_str(text).context("payload is not valid JSON5")?,
        None => Value::Object(Default::default()),
    };
    let mut job = NewJob::new(args.task, payload).with_flags(args.flags);
    if let Some(queue) = args.queue {
        job = job.with_queue(queue);
    }
    if let Some(run_at) = args.run_at {
        let run_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&run_at)
            .with_context(|| format!("invalid --run-at '{run_at}'"))?
            .with_timezone(&Utc);
        job = job.with_run_at(run_at);
    }
    if let Some(max) = args.max_attempts {
        job = job.with_max_attempts(max);
    }
    if let Some(priority) = args.priority {
        job = job.with_priority(priority);
    }
    if let Some(key) = args.key {
        let mode: JobKeyMode = args
            .key_mode
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid --key-mode: {e}"))?;
        job = job.with_key(key, mode);
    }
    Ok(job)
}

pub async fn reset_locks(config: &DroverConfig) -> Result<()> {
    let store = open_store(config).await?;
    let counts = store.reset_stale_locks().await?;
    println!(
        "reset {} job lock(s) and {} queue lock(s)",
        counts.jobs, counts.queues
    );
    Ok(())
}

pub async fn show_job(config: &DroverConfig, id: i64) -> Result<()> {
    let store = open_store(config).await?;
    match store.get_job(id).await? {
        Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
        None => bail!("job {id} not found"),
    }
    Ok(())
}

pub async fn queues(config: &DroverConfig) -> Result<()> {
    let store = open_store(config).await?;
    let queues = store.job_queues().await?;
    if queues.is_empty() {
        println!("no queues");
    }
    for q in queues {
        match (&q.locked_by, q.locked_at) {
            (Some(by), Some(at)) => println!("{}\tlocked by {by} since {}", q.queue_name, at.to_rfc3339()),
            _ => println!("{}\tfree", q.queue_name),
        }
    }
    Ok(())
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    if path == ":memory:" {
        return Ok(());
    }
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(task: &str) -> AddJobArgs {
        AddJobArgs {
            task: task.to_string(),
            payload: None,
            queue: None,
            run_at: None,
            max_attempts: None,
            priority: None,
            key: None,
            key_mode: "replace".into(),
            flags: Vec::new(),
        }
    }

    #[test]
    fn job_from_args() {
        let mut a = args("send_email");
        a.payload = Some("{to: 'a@example.com'}".into());
        a.queue = Some("mail".into());
        a.run_at = Some("2030-01-01T00:00:00Z".into());
        a.key = Some("welcome:7".into());
        a.key_mode = "dedupe".into();
        a.flags = vec!["tenant:7".into()];
        let job = build_job(a).unwrap();
        assert_eq!(job.payload["to"], "a@example.com");
        assert_eq!(job.queue_name.as_deref(), Some("mail"));
        assert_eq!(job.key.as_deref(), Some("welcome:7"));
        assert_eq!(job.key_mode, JobKeyMode::Dedupe);
        assert!(job.flags.contains("tenant:7"));
        assert!(job.run_at.is_some());
    }

    #[test]
    fn empty_payload_defaults_to_object() {
        let job = build_job(args("noop")).unwrap();
        assert_eq!(job.payload, serde_json::json!({}));
    }

    #[test]
    fn bad_inputs_rejected() {
        let mut a = args("x");
        a.payload = Some("{not json".into());
        assert!(build_job(a).is_err());

        let mut a = args("x");
        a.run_at = Some("tomorrow".into());
        assert!(build_job(a).is_err());

        let mut a = args("x");
        a.key = Some("k".into());
        a.key_mode = "sideways".into();
        assert!(build_job(a).is_err());
    }

    #[tokio::test]
    async fn add_and_show_against_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DroverConfig::default();
        config.database.path = dir.path().join("q/drover.db").to_string_lossy().into_owned();

        migrate(&config).await.unwrap();
        add_job(&config, args("noop")).await.unwrap();
        show_job(&config, 1).await.unwrap();
        assert!(show_job(&config, 99).await.is_err());
        reset_locks(&config).await.unwrap();
    }

    #[test]
    fn database_directory_errors_surface() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let db = blocker.join("nested").join("jobs.db");
        let err = ensure_parent_dir(db.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().starts_with("creating database directory"));

        let db = dir.path().join("fresh").join("jobs.db");
        ensure_parent_dir(db.to_str().unwrap()).unwrap();
        assert!(dir.path().join("fresh").is_dir());
        ensure_parent_dir(":memory:").unwrap();
    }

    #[test]
    fn crontab_check_requires_a_path() {
        assert!(check_crontab(&DroverConfig::default(), None).is_err());
    }
}
