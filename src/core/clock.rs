use std::fmt;

/// Source of wall-clock time in epoch milliseconds.
///
/// Session expiry and visit timestamps read time through this trait so tests
/// can drive expiry without sleeping.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Render an epoch-millisecond timestamp as RFC 3339 for display.
pub fn format_timestamp(epoch_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .map(|at| at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| epoch_ms.to_string())
}
