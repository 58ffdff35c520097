use chrono::{DateTime, Duration, Utc};

/// Exponent cap: attempts beyond this all wait `e^10` seconds (~6.1 hours).
pub const MAX_BACKOFF_EXPONENT: i32 = 10;

/// Retry delay after the given number of attempts: `e^min(attempts, 10)` seconds.
pub fn backoff(attempts: i32) -> Duration {
    let exponent = attempts.clamp(0, MAX_BACKOFF_EXPONENT) as f64;
    Duration::milliseconds((exponent.exp() * 1000.0).round() as i64)
}

/// When a failed job becomes eligible again. A job scheduled in the future
/// keeps its schedule and the backoff is added on top.
pub fn retry_at(now: DateTime<Utc>, run_at: DateTime<Utc>, attempts: i32) -> DateTime<Utc> {
    now.max(run_at) + backoff(attempts)
}
