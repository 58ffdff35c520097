use thiserror::Error;

/// Errors raised while parsing crontab text or programmatic cron items.
///
/// Messages name the offending field and where it came from, e.g.
/// `minutes range in line 3 of crontab`.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("Could not process line '{line}' of crontab: '{text}'")]
    Line { line: usize, text: String },

    #[error("Invalid cron pattern '{pattern}' in {location}")]
    Pattern { pattern: String, location: String },

    #[error("Invalid command specification in line {line} of crontab.")]
    Command { line: usize },

    #[error("Invalid task identifier '{task}' in {location}")]
    Task { task: String, location: String },

    #[error("Too large value '{value}' in {location}: expected values in the range {min}-{max}.")]
    TooLarge {
        value: String,
        location: String,
        min: u8,
        max: u8,
    },

    #[error("Too small value '{value}' in {location}: expected values in the range {min}-{max}.")]
    TooSmall {
        value: String,
        location: String,
        min: u8,
        max: u8,
    },

    #[error("Invalid range '{part}' in {location}: destination is not larger than source")]
    Range { part: String, location: String },

    #[error("Invalid wildcard expression '{part}' in {location}: divisor '{divisor}' expected to be greater than zero")]
    Wildcard {
        part: String,
        location: String,
        divisor: String,
    },

    #[error("Unsupported syntax '{part}' in {location}: this doesn't appear to be a number, range or wildcard")]
    Syntax { part: String, location: String },

    #[error("Options on line {line} of crontab contains unsupported key '{key}'; supported keys are: '{}'.", .supported.join("', '"))]
    UnsupportedOption {
        line: usize,
        key: String,
        supported: Vec<&'static str>,
    },

    #[error("Options on line {line} of crontab contains invalid value for '{key}', did you specify it more than once?")]
    DuplicateOption { line: usize, key: String },

    #[error("Options on line {line} of crontab contains invalid value for '{key}', value '{value}' is not compatible with this option.")]
    OptionValue {
        line: usize,
        key: String,
        value: String,
    },

    #[error("Invalid value '{value}' for option '{key}' in {location}")]
    ItemOption {
        location: String,
        key: &'static str,
        value: String,
    },

    #[error("Invalid time phrase '{phrase}', did not understand '{remaining}'")]
    TimePhrase { phrase: String, remaining: String },

    #[error("Failed to parse JSON5 payload on line {line} of crontab: {message}")]
    Payload { line: usize, message: String },

    #[error("Invalid crontab; duplicate identifiers found: '{}' - please use '?id=...' to specify unique identifiers for your cron items", .0.join("', '"))]
    DuplicateIdentifiers(Vec<String>),

    #[error("Failed to read crontab '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CronError>;
