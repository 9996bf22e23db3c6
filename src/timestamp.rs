use std::fmt;

use chrono::{Local, NaiveDateTime, Timelike};
use thiserror::Error;

/// Canonical timestamp format used for every persisted timestamp:
/// microsecond precision, colon before the fractional part.
pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S:%6f";

#[derive(Debug, Error)]
#[error("timestamp {value:?} does not match format {format:?}")]
pub struct TimestampParseError {
    value: String,
    format: String,
}

#[derive(Debug, Error)]
#[error("{format:?} is not a valid timestamp format")]
pub struct TimestampFormatError {
    format: String,
}

/// A wall-clock instant truncated to microsecond precision.
///
/// Truncating at construction means formatting with the canonical format
/// and re-parsing always round-trips to an equal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp::from_datetime(Local::now().naive_local())
    }

    fn from_datetime(datetime: NaiveDateTime) -> Self {
        let micros = datetime.nanosecond() / 1000 * 1000;
        Timestamp(datetime.with_nanosecond(micros).unwrap_or(datetime))
    }

    /// Formats with a format string that has already been validated (the
    /// configuration rejects formats that cannot round-trip).
    pub fn format_with(&self, format: &str) -> String {
        self.try_format_with(format)
            .expect("timestamp format was validated at startup")
    }

    /// Formatting fails when the format string contains items chrono does
    /// not recognize; used by configuration validation.
    pub fn try_format_with(&self, format: &str) -> Result<String, TimestampFormatError> {
        use std::fmt::Write;
        let mut out = String::new();
        match write!(out, "{}", self.0.format(format)) {
            Ok(()) => Ok(out),
            Err(_) => Err(TimestampFormatError {
                format: format.to_string(),
            }),
        }
    }

    pub fn parse_with(value: &str, format: &str) -> Result<Self, TimestampParseError> {
        match NaiveDateTime::parse_from_str(value, format) {
            Ok(datetime) => Ok(Timestamp::from_datetime(datetime)),
            Err(_) => Err(TimestampParseError {
                value: value.to_string(),
                format: format.to_string(),
            }),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(CANONICAL_FORMAT))
    }
}
