use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CronError, Result};

/// Just the five time fields of a crontab line.
static CRONTAB_TIME_PARTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9*/,-]+)\s+([0-9*/,-]+)\s+([0-9*/,-]+)\s+([0-9*/,-]+)\s+([0-9*/,-]+)$")
        .unwrap()
});
static CRONTAB_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([0-9]+)$").unwrap());
static CRONTAB_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)-([0-9]+)$").unwrap());
static CRONTAB_WILDCARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*(?:/([0-9]+))?$").unwrap());

/// Calendar fields of a UTC instant, in the shape the matcher consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeDigest {
    pub minute: u8,
    pub hour: u8,
    /// Day of month, 1-31.
    pub date: u8,
    /// 1-12.
    pub month: u8,
    /// 0 = Sunday.
    pub dow: u8,
}

impl TimeDigest {
    pub fn from_datetime(ts: &DateTime<Utc>) -> Self {
        Self {
            minute: ts.minute() as u8,
            hour: ts.hour() as u8,
            date: ts.day() as u8,
            month: ts.month() as u8,
            dow: ts.weekday().num_days_from_sunday() as u8,
        }
    }
}

/// Parsed five-field schedule. Each set is sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronMatch {
    pub minutes: Vec<u8>,
    pub hours: Vec<u8>,
    pub dates: Vec<u8>,
    pub months: Vec<u8>,
    pub dows: Vec<u8>,
}

impl CronMatch {
    /// Parse a bare pattern such as `*/15 9-17 * * 1-5`.
    pub fn parse(pattern: &str, location: &str) -> Result<Self> {
        let caps = CRONTAB_TIME_PARTS
            .captures(pattern)
            .ok_or_else(|| CronError::Pattern {
                pattern: pattern.to_string(),
                location: location.to_string(),
            })?;
        Self::from_fields([&caps[1], &caps[2], &caps[3], &caps[4], &caps[5]], location)
    }

    pub(crate) fn from_fields(fields: [&str; 5], location: &str) -> Result<Self> {
        Ok(Self {
            minutes: parse_range(&format!("minutes range in {location}"), fields[0], 0, 59, false)?,
            hours: parse_range(&format!("hours range in {location}"), fields[1], 0, 23, false)?,
            dates: parse_range(&format!("dates range in {location}"), fields[2], 1, 31, false)?,
            months: parse_range(&format!("months range in {location}"), fields[3], 1, 12, false)?,
            dows: parse_range(
                &format!("days of week range in {location}"),
                fields[4],
                0,
                6,
                true,
            )?,
        })
    }

    /// Minute, hour and month must all match. Date and day-of-week follow the
    /// classic cron union: when both are restricted either may match.
    pub fn matches(&self, digest: &TimeDigest) -> bool {
        if !(self.minutes.contains(&digest.minute)
            && self.hours.contains(&digest.hour)
            && self.months.contains(&digest.month))
        {
            return false;
        }

        let date_restricted = self.dates.len() != 31;
        let dow_restricted = self.dows.len() != 7;
        match (date_restricted, dow_restricted) {
            (true, true) => self.dates.contains(&digest.date) || self.dows.contains(&digest.dow),
            (true, false) => self.dates.contains(&digest.date),
            (false, true) => self.dows.contains(&digest.dow),
            (false, false) => true,
        }
    }

    pub fn matches_at(&self, ts: &DateTime<Utc>) -> bool {
        self.matches(&TimeDigest::from_datetime(ts))
    }
}

/// Parse one comma-separated crontab field into a sorted, unique set.
///
/// Each element is an exact number, a range `a-b` with `b > a`, or `*` with an
/// optional `/n` step. With `wrap`, the value `max + 1` is read as `min`
/// (day-of-week `7` meaning Sunday).
pub fn parse_range(location: &str, range: &str, min: u8, max: u8, wrap: bool) -> Result<Vec<u8>> {
    let mut numbers: Vec<u8> = Vec::new();

    let too_large = |raw: &str| CronError::TooLarge {
        value: raw.to_string(),
        location: location.to_string(),
        min,
        max,
    };

    let add = |raw: &str, numbers: &mut Vec<u8>| -> Result<()> {
        let number: u32 = raw.parse().map_err(|_| too_large(raw))?;
        let wrapped = if wrap && number == u32::from(max) + 1 {
            u32::from(min)
        } else {
            number
        };
        if wrapped > u32::from(max) {
            return Err(too_large(raw));
        }
        if wrapped < u32::from(min) {
            return Err(CronError::TooSmall {
                value: raw.to_string(),
                location: location.to_string(),
                min,
                max,
            });
        }
        numbers.push(wrapped as u8);
        Ok(())
    };

    for part in range.split(',') {
        if let Some(caps) = CRONTAB_NUMBER.captures(part) {
            add(&caps[1], &mut numbers)?;
            continue;
        }

        if let Some(caps) = CRONTAB_RANGE.captures(part) {
            let a: u32 = caps[1].parse().map_err(|_| too_large(&caps[1]))?;
            let b: u32 = caps[2].parse().map_err(|_| too_large(&caps[2]))?;
            if b <= a {
                return Err(CronError::Range {
                    part: part.to_string(),
                    location: location.to_string(),
                });
            }
            for i in a..=b {
                add(&i.to_string(), &mut numbers)?;
            }
            continue;
        }

        if let Some(caps) = CRONTAB_WILDCARD.captures(part) {
            let divisor: u32 = match caps.get(1) {
                Some(d) => d.as_str().parse().map_err(|_| too_large(d.as_str()))?,
                None => 1,
            };
            if divisor == 0 {
                return Err(CronError::Wildcard {
                    part: part.to_string(),
                    location: location.to_string(),
                    divisor: caps.get(1).map_or("", |d| d.as_str()).to_string(),
                });
            }
            let mut i = u32::from(min);
            while i <= u32::from(max) {
                numbers.push(i as u8);
                match i.checked_add(divisor) {
                    Some(next) => i = next,
                    None => break,
                }
            }
            continue;
        }

        return Err(CronError::Syntax {
            part: part.to_string(),
            location: location.to_string(),
        });
    }

    numbers.sort_unstable();
    numbers.dedup();
    Ok(numbers)
}
