//! `drover-cron`: crontab parsing and schedule matching.
//!
//! # Crontab format
//!
//! ```text
//! ┌───────────── minute (0 - 59)
//! │ ┌─────────── hour (0 - 23)
//! │ │ ┌───────── day of month (1 - 31)
//! │ │ │ ┌─────── month (1 - 12)
//! │ │ │ │ ┌───── day of week (0 - 6, Sunday = 0 or 7)
//! │ │ │ │ │
//! * * * * * task_identifier ?id=x&fill=1d&max=5&queue=q&priority=1 {json5: "payload"}
//! ```
//!
//! | Option     | Meaning                                          |
//! |------------|--------------------------------------------------|
//! | `id`       | Unique identifier (defaults to the task name)    |
//! | `fill`     | Backfill window as a time phrase, e.g. `2d12h`   |
//! | `max`      | Max attempts for the enqueued job                |
//! | `queue`    | Serial queue name                                |
//! | `priority` | Job priority (lower runs sooner)                 |

pub mod crontab;
pub mod error;
pub mod file;
pub mod item;
pub mod matcher;
pub mod timephrase;

pub use crontab::{parse_crontab, parse_crontab_line};
pub use error::{CronError, Result};
pub use file::load_crontab_file;
pub use item::{parse_cron_item, parse_cron_items, CronItem, CronItemOptions, CronPattern, ParsedCronItem};
pub use matcher::{parse_range, CronMatch, TimeDigest};
pub use timephrase::{parse_time_phrase, DAY, HOUR, MINUTE, SECOND, WEEK};
