use std::sync::LazyLock;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{CronError, Result};
use crate::item::{ensure_unique_identifiers, CronItemOptions, ParsedCronItem};
use crate::matcher::CronMatch;
use crate::timephrase::parse_time_phrase;

/// Minute, hour, date, month, dow, then the command.
static CRONTAB_LINE_PARTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([0-9*/,-]+)\s+([0-9*/,-]+)\s+([0-9*/,-]+)\s+([0-9*/,-]+)\s+([0-9*/,-]+)\s+(.*)$",
    )
    .unwrap()
});
/// Task, optional `?options`, optional `{payload}`.
static CRONTAB_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([_a-zA-Z][_a-zA-Z0-9:_-]*)(?:\s+\?([^\s]+))?(?:\s+(\{.*\}))?$").unwrap()
});
pub(crate) static OPTION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([_a-zA-Z][-_a-zA-Z0-9]*)$").unwrap());
static OPTION_FILL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^((?:[0-9]+[smhdw])+)$").unwrap());
static OPTION_MAX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([0-9]+)$").unwrap());
pub(crate) static OPTION_QUEUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([-a-zA-Z0-9_:]+)$").unwrap());
static OPTION_PRIORITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-?[0-9]+)$").unwrap());

const SUPPORTED_OPTIONS: [&str; 5] = ["id", "fill", "max", "queue", "priority"];

/// Parse a whole crontab. Blank lines and `#` comments are skipped; line
/// numbers in errors are 1-based.
pub fn parse_crontab(crontab: &str) -> Result<Vec<ParsedCronItem>> {
    let mut items = Vec::new();
    for (idx, raw) in crontab.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        items.push(parse_crontab_line(line, idx + 1)?);
    }
    ensure_unique_identifiers(&items)?;
    Ok(items)
}

/// Parse one crontab line such as `0 4 * * 1 weekly_digest ?fill=2d {to: "ops"}`.
pub fn parse_crontab_line(line: &str, line_number: usize) -> Result<ParsedCronItem> {
    let caps = CRONTAB_LINE_PARTS
        .captures(line)
        .ok_or_else(|| CronError::Line {
            line: line_number,
            text: line.to_string(),
        })?;
    let pattern = CronMatch::from_fields(
        [&caps[1], &caps[2], &caps[3], &caps[4], &caps[5]],
        &format!("line {line_number} of crontab"),
    )?;

    let command = CRONTAB_COMMAND
        .captures(&caps[6])
        .ok_or(CronError::Command { line: line_number })?;
    let task = command[1].to_string();
    let parsed = parse_options(line_number, command.get(2).map(|m| m.as_str()))?;
    let payload = parse_payload(line_number, command.get(3).map(|m| m.as_str()))?;

    Ok(ParsedCronItem {
        identifier: parsed.identifier.unwrap_or_else(|| task.clone()),
        task,
        pattern,
        payload,
        options: parsed.options,
    })
}

struct ParsedOptions {
    options: CronItemOptions,
    identifier: Option<String>,
}

fn parse_options(line: usize, raw: Option<&str>) -> Result<ParsedOptions> {
    let mut parsed = ParsedOptions {
        options: CronItemOptions::default(),
        identifier: None,
    };
    let Some(raw) = raw else {
        return Ok(parsed);
    };

    // Group values by key first so a repeated key is reported as such.
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match grouped.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value.into_owned()),
            None => grouped.push((key.into_owned(), vec![value.into_owned()])),
        }
    }

    for (key, values) in grouped {
        if values.len() > 1 {
            return Err(CronError::DuplicateOption { line, key });
        }
        let value = &values[0];
        let regex = match key.as_str() {
            "id" => &OPTION_ID,
            "fill" => &OPTION_FILL,
            "max" => &OPTION_MAX,
            "queue" => &OPTION_QUEUE,
            "priority" => &OPTION_PRIORITY,
            _ => {
                return Err(CronError::UnsupportedOption {
                    line,
                    key,
                    supported: SUPPORTED_OPTIONS.to_vec(),
                })
            }
        };
        let invalid = || CronError::OptionValue {
            line,
            key: key.clone(),
            value: value.clone(),
        };
        if !regex.is_match(value) {
            return Err(invalid());
        }
        match key.as_str() {
            "id" => parsed.identifier = Some(value.clone()),
            "fill" => parsed.options.backfill_period = parse_time_phrase(value)?,
            "max" => {
                let max: i32 = value.parse().map_err(|_| invalid())?;
                if max < 1 {
                    return Err(invalid());
                }
                parsed.options.max_attempts = Some(max);
            }
            "queue" => parsed.options.queue_name = Some(value.clone()),
            "priority" => {
                parsed.options.priority = Some(value.parse().map_err(|_| invalid())?)
            }
            _ => unreachable!("option keys are matched above"),
        }
    }

    Ok(parsed)
}

fn parse_payload(line: usize, raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(Value::Object(Map::new())),
        Some(text) => json5::from_str::<Value>(text).map_err(|e| CronError::Payload {
            line,
            message: e.to_string(),
        }),
    }
}
