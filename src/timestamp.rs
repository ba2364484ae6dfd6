//! Conversion between external timestamps and [`Ms`].
//!
//! Accepted inputs:
//! - RFC 3339 (`2024-01-01T10:00:00Z`, `2024-01-01T12:00:00+02:00`)
//! - naive `2024-01-01 10:00:00[.fff]` or `2024-01-01T10:00:00[.fff]`, read as UTC
//! - a bare integer of Unix milliseconds
//!
//! Range literals follow the `["start","end")` text form used for booking
//! windows; see [`parse_range`].

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

use crate::model::{Ms, Window};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

pub fn parse_timestamp(text: &str) -> Result<Ms, TimestampError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TimestampError::Empty);
    }
    if let Ok(ms) = text.parse::<Ms>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    Err(TimestampError::BadTimestamp(text.to_string()))
}

/// RFC 3339 with millisecond precision. Falls back to the raw number when
/// outside chrono's range.
pub fn format_timestamp(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

/// Parse a range literal into a half-open window.
///
/// `[` / `]` are inclusive bounds, `(` / `)` exclusive. An exclusive lower
/// bound moves `start` forward by 1 ms and an inclusive upper bound moves
/// `end` forward by 1 ms, so the result is always `[start, end)`.
pub fn parse_range(text: &str) -> Result<Window, TimestampError> {
    let text = text.trim();
    let mut chars = text.chars();
    let lower_inclusive = match chars.next() {
        Some('[') => true,
        Some('(') => false,
        _ => return Err(TimestampError::BadRange(text.to_string())),
    };
    let upper_inclusive = match chars.next_back() {
        Some(']') => true,
        Some(')') => false,
        _ => return Err(TimestampError::BadRange(text.to_string())),
    };
    let inner = chars.as_str();
    let (lo, hi) = inner
        .split_once(',')
        .ok_or_else(|| TimestampError::BadRange(text.to_string()))?;

    let start = parse_timestamp(unquote(lo))?;
    let end = parse_timestamp(unquote(hi))?;
    let start = if lower_inclusive { Some(start) } else { start.checked_add(1) };
    let end = if upper_inclusive { end.checked_add(1) } else { Some(end) };
    let (Some(start), Some(end)) = (start, end) else {
        return Err(TimestampError::BadRange(text.to_string()));
    };
    Window::checked(start, end).ok_or(TimestampError::EmptyRange { start, end })
}

/// Render as `["start","end")`.
pub fn format_range(window: &Window) -> String {
    format!(
        "[\"{}\",\"{}\")",
        format_timestamp(window.start),
        format_timestamp(window.end)
    )
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    Empty,
    BadTimestamp(String),
    BadRange(String),
    EmptyRange { start: Ms, end: Ms },
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampError::Empty => write!(f, "empty timestamp"),
            TimestampError::BadTimestamp(s) => write!(f, "unrecognised timestamp: {s}"),
            TimestampError::BadRange(s) => write!(f, "malformed range literal: {s}"),
            TimestampError::EmptyRange { start, end } => {
                write!(f, "range [{start}, {end}) is empty or inverted")
            }
        }
    }
}

impl std::error::Error for TimestampError {}
