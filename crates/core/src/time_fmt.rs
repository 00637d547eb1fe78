// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Human-readable duration format used on the wire.
//!
//! Concatenated integer-and-unit segments: `1h30m`, `45s`, `2d`.
//! Units are `s`, `m`, `h`, `d`; a bare integer means seconds.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("empty duration string")]
    Empty,
    #[error("invalid number in duration: {0:?}")]
    BadNumber(String),
    #[error("unknown duration unit: {0:?}")]
    BadUnit(String),
    #[error("duration overflows")]
    Overflow,
}

/// Parse a duration string like `45s`, `1h30m`, `2d`, or a bare `90`.
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationParseError::Empty);
    }

    // Bare integer means seconds.
    if s.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = s.parse().map_err(|_| DurationParseError::BadNumber(s.to_string()))?;
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(DurationParseError::BadNumber(rest.to_string()));
        }
        let num: u64 = rest[..digits_end]
            .parse()
            .map_err(|_| DurationParseError::BadNumber(rest[..digits_end].to_string()))?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let multiplier: u64 = match unit {
            "" | "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86_400,
            other => return Err(DurationParseError::BadUnit(other.to_string())),
        };
        let secs = num.checked_mul(multiplier).ok_or(DurationParseError::Overflow)?;
        total = total.checked_add(secs).ok_or(DurationParseError::Overflow)?;
    }

    Ok(Duration::from_secs(total))
}

/// Format a duration compactly for human output: `1h30m`, `45s`, `2d3h`.
///
/// Sub-second durations render as `0s`; fractional parts are truncated.
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, label) in [(86_400, "d"), (3600, "h"), (60, "m"), (1, "s")] {
        let n = secs / unit;
        if n > 0 {
            out.push_str(&format!("{n}{label}"));
            secs -= n * unit;
        }
    }
    out
}

#[cfg(test)]
#[path = "time_fmt_tests.rs"]
mod tests;
