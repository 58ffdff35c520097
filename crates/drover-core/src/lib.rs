//! `drover-core`: shared types, configuration and time source for the
//! drover job queue.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DroverConfig;
pub use error::{CoreError, Result};
pub use types::{Job, JobKeyMode, JobQueue, KnownCrontab, NewJob};
