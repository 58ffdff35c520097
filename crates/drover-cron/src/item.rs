use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};

use crate::crontab::{OPTION_ID, OPTION_QUEUE};
use crate::error::{CronError, Result};
use crate::matcher::CronMatch;

pub(crate) static TASK_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[_a-zA-Z][_a-zA-Z0-9:_-]*$").unwrap());

/// Either a pattern string still to be parsed, or an already parsed match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronPattern {
    Pattern(String),
    Parsed(CronMatch),
}

impl From<&str> for CronPattern {
    fn from(s: &str) -> Self {
        CronPattern::Pattern(s.to_string())
    }
}

impl From<CronMatch> for CronPattern {
    fn from(m: CronMatch) -> Self {
        CronPattern::Parsed(m)
    }
}

/// Per-item job options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CronItemOptions {
    /// How far back to fill in missed runs on startup. Zero disables backfill.
    pub backfill_period: Duration,
    pub max_attempts: Option<i32>,
    pub queue_name: Option<String>,
    pub priority: Option<i32>,
}

/// A cron item as supplied by library callers.
#[derive(Debug, Clone, PartialEq)]
pub struct CronItem {
    pub task: String,
    pub pattern: CronPattern,
    /// Defaults to `{}`.
    pub payload: Option<Value>,
    /// Defaults to the task identifier.
    pub identifier: Option<String>,
    pub options: CronItemOptions,
}

impl CronItem {
    pub fn new(task: impl Into<String>, pattern: impl Into<CronPattern>) -> Self {
        Self {
            task: task.into(),
            pattern: pattern.into(),
            payload: None,
            identifier: None,
            options: CronItemOptions::default(),
        }
    }
}

/// A validated cron item ready for the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCronItem {
    pub task: String,
    pub pattern: CronMatch,
    pub payload: Value,
    /// Unique within one schedule; keys the persisted watermark.
    pub identifier: String,
    pub options: CronItemOptions,
}

/// Validate and parse a list of programmatic cron items.
pub fn parse_cron_items(items: &[CronItem]) -> Result<Vec<ParsedCronItem>> {
    let parsed = items
        .iter()
        .enumerate()
        .map(|(idx, item)| parse_cron_item(item, &format!("item {idx} of cron items")))
        .collect::<Result<Vec<_>>>()?;
    ensure_unique_identifiers(&parsed)?;
    Ok(parsed)
}

pub fn parse_cron_item(item: &CronItem, location: &str) -> Result<ParsedCronItem> {
    if !TASK_IDENTIFIER.is_match(&item.task) {
        return Err(CronError::Task {
            task: item.task.clone(),
            location: location.to_string(),
        });
    }
    validate_options(item, location)?;
    let pattern = match &item.pattern {
        CronPattern::Pattern(p) => CronMatch::parse(p, location)?,
        CronPattern::Parsed(m) => m.clone(),
    };
    Ok(ParsedCronItem {
        task: item.task.clone(),
        pattern,
        payload: item
            .payload
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new())),
        identifier: item.identifier.clone().unwrap_or_else(|| item.task.clone()),
        options: item.options.clone(),
    })
}

/// Hold programmatic items to the same rules as `?id=`, `max=` and `queue=`
/// in a crontab.
fn validate_options(item: &CronItem, location: &str) -> Result<()> {
    let invalid = |key: &'static str, value: String| CronError::ItemOption {
        location: location.to_string(),
        key,
        value,
    };
    if let Some(id) = &item.identifier {
        if !OPTION_ID.is_match(id) {
            return Err(invalid("identifier", id.clone()));
        }
    }
    if let Some(max) = item.options.max_attempts {
        if max < 1 {
            return Err(invalid("max_attempts", max.to_string()));
        }
    }
    if let Some(queue) = &item.options.queue_name {
        if !OPTION_QUEUE.is_match(queue) {
            return Err(invalid("queue_name", queue.clone()));
        }
    }
    Ok(())
}

/// Reject schedules where two items share an identifier, naming each clash once.
pub(crate) fn ensure_unique_identifiers(items: &[ParsedCronItem]) -> Result<()> {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for item in items {
        if !seen.insert(item.identifier.as_str()) {
            duplicates.insert(item.identifier.clone());
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(CronError::DuplicateIdentifiers(duplicates.into_iter().collect()))
    }
}
