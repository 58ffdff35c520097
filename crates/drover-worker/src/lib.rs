//! `drover-worker`: executes queued jobs and schedules cron jobs.
//!
//! A [`Runner`] owns a [`WorkerPool`] of `concurrency` [`Worker`]s plus a
//! [`Cron`] scheduler, all sharing one [`drover_store::JobStore`]. Workers
//! poll the store, run the registered [`TaskHandler`] and report success or
//! failure back; failed jobs are retried with exponential backoff.
//!
//! ```no_run
//! use std::sync::Arc;
//! use drover_core::DroverConfig;
//! use drover_worker::{JobHelpers, Runner, TaskList, TaskOutput};
//! use serde_json::Value;
//!
//! async fn send_email(payload: Value, _helpers: JobHelpers) -> anyhow::Result<TaskOutput> {
//!     println!("sending to {}", payload["to"]);
//!     Ok(TaskOutput::Done)
//! }
//!
//! # async fn demo() -> drover_worker::Result<()> {
//! let tasks = TaskList::new().with("send_email", send_email);
//! let runner = Runner::from_config(&DroverConfig::default(), Arc::new(tasks)).await?;
//! runner.wait().await
//! # }
//! ```

pub mod cron;
pub mod error;
pub mod events;
pub mod helpers;
pub mod options;
pub mod pool;
pub mod registry;
pub mod releasers;
pub mod runner;
mod signals;
pub mod task;
pub mod worker;

pub use cron::{cron_job, Cron, CronItems};
pub use error::{Result, WorkerError};
pub use events::{EventBus, WorkerEvent};
pub use helpers::JobHelpers;
pub use options::{CompiledOptions, ForbiddenFlags};
pub use pool::WorkerPool;
pub use registry::{ReloadableTasks, TaskList, TaskRegistry};
pub use releasers::Releasers;
pub use runner::{run_once, Runner};
pub use task::{BatchOutcome, TaskHandler, TaskOutput};
pub use worker::{make_worker_id, Worker};
