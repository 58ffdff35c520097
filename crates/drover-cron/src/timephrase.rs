use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{CronError, Result};

/// One second in milliseconds.
pub const SECOND: u64 = 1000;
/// One minute in milliseconds.
pub const MINUTE: u64 = 60 * SECOND;
/// One hour in milliseconds.
pub const HOUR: u64 = 60 * MINUTE;
/// One day in milliseconds.
pub const DAY: u64 = 24 * HOUR;
/// One week in milliseconds.
pub const WEEK: u64 = 7 * DAY;

static TIMEPHRASE_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)([smhdw])").unwrap());

fn period_ms(unit: &str) -> u64 {
    match unit {
        "s" => SECOND,
        "m" => MINUTE,
        "h" => HOUR,
        "d" => DAY,
        "w" => WEEK,
        _ => 0,
    }
}

/// Parse a time phrase such as `4w3d2h1m` into a duration.
///
/// Tokens are `<quantity><unit>` with units `s`, `m`, `h`, `d`, `w`, consumed
/// left to right and summed. Anything left over is an error.
pub fn parse_time_phrase(phrase: &str) -> Result<Duration> {
    let mut remaining = phrase;
    let mut total_ms: u64 = 0;

    while !remaining.is_empty() {
        let caps = TIMEPHRASE_PART
            .captures(remaining)
            .ok_or_else(|| CronError::TimePhrase {
                phrase: phrase.to_string(),
                remaining: remaining.to_string(),
            })?;
        let whole = caps.get(0).map_or(0, |m| m.len());
        let quantity: u64 = caps[1].parse().map_err(|_| CronError::TimePhrase {
            phrase: phrase.to_string(),
            remaining: remaining.to_string(),
        })?;
        total_ms = total_ms.saturating_add(quantity.saturating_mul(period_ms(&caps[2])));
        remaining = &remaining[whole..];
    }

    Ok(Duration::from_millis(total_ms))
}
