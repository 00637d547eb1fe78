// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Five-field cron expressions and timezone-aware evaluation.
//!
//! Fields: minute, hour, day-of-month, month, day-of-week. Supports `*`,
//! comma lists, hyphen ranges, `*/step` and `a-b/step`, plus three-letter
//! month and weekday names. When day-of-month and day-of-week are both
//! restricted, a day matches if *either* field matches (the classic cron
//! union rule).
//!
//! Evaluation runs in a configured timezone. Local times erased by a
//! spring-forward transition are skipped; local times repeated by a
//! fall-back transition fire once.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

const MONTH_NAMES: [&str; 12] =
    ["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"];
const DOW_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far ahead to search for the next occurrence before concluding the
/// expression can never fire (e.g. `0 0 30 2 *`).
const SEARCH_HORIZON_DAYS: i64 = 4 * 366;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field {text:?}")]
    BadField { field: &'static str, text: String },
    #[error("{field} value {value} out of range {min}..={max}")]
    OutOfRange { field: &'static str, value: u32, min: u32, max: u32 },
}

/// A parsed five-field cron expression.
///
/// Each field is a bitmask over its value range, so matching a candidate
/// minute is a handful of bit tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    dom: u32,
    months: u16,
    dow: u8,
    dom_restricted: bool,
    dow_restricted: bool,
    source: String,
}

impl std::str::FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }

        let minutes = parse_field(fields[0], "minute", 0, 59, &[])?;
        let hours = parse_field(fields[1], "hour", 0, 23, &[])? as u32;
        let dom = parse_field(fields[2], "day-of-month", 1, 31, &[])? as u32;
        let months = parse_field(fields[3], "month", 1, 12, &MONTH_NAMES)? as u16;
        let dow = parse_field(fields[4], "day-of-week", 0, 7, &DOW_NAMES)? as u8;

        Ok(CronExpr {
            minutes,
            hours,
            dom,
            months,
            dow,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
            source: s.trim().to_string(),
        })
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl CronExpr {
    /// Whether a local wall-clock minute matches this expression.
    pub fn matches(&self, local: &NaiveDateTime) -> bool {
        self.minutes & (1 << local.minute()) != 0
            && self.hours & (1 << local.hour()) != 0
            && self.months & (1 << local.month()) != 0
            && self.day_matches(&local.date())
    }

    fn day_matches(&self, date: &NaiveDate) -> bool {
        let dom_hit = self.dom & (1 << date.day()) != 0;
        let dow_hit = self.dow & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            // Union rule: either restricted field may claim the day.
            (true, true) => dom_hit || dow_hit,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            (false, false) => true,
        }
    }

    /// The next instant strictly after `after` at which this expression
    /// fires in `tz`, or `None` if no occurrence exists within the
    /// search horizon.
    pub fn next_after(&self, after: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(tz).naive_local();
        let mut cand = truncate_to_minute(local) + ChronoDuration::minutes(1);
        let horizon = cand + ChronoDuration::days(SEARCH_HORIZON_DAYS);

        while cand < horizon {
            if self.months & (1 << cand.month()) == 0 {
                cand = first_of_next_month(cand)?;
                continue;
            }
            if !self.day_matches(&cand.date()) {
                cand = cand.date().succ_opt()?.and_time(NaiveTime::MIN);
                continue;
            }
            if self.hours & (1 << cand.hour()) == 0 {
                cand = truncate_to_hour(cand) + ChronoDuration::hours(1);
                continue;
            }
            if self.minutes & (1 << cand.minute()) == 0 {
                cand += ChronoDuration::minutes(1);
                continue;
            }

            match tz.from_local_datetime(&cand) {
                // Erased by spring-forward: advance to the next match.
                LocalResult::None => {
                    cand += ChronoDuration::minutes(1);
                }
                LocalResult::Single(t) => {
                    let utc = t.with_timezone(&Utc);
                    if utc > after {
                        return Some(utc);
                    }
                    cand += ChronoDuration::minutes(1);
                }
                // Repeated by fall-back: fire on the earliest occurrence
                // still in the future, never on both.
                LocalResult::Ambiguous(a, b) => {
                    for t in [a, b] {
                        let utc = t.with_timezone(&Utc);
                        if utc > after {
                            return Some(utc);
                        }
                    }
                    cand += ChronoDuration::minutes(1);
                }
            }
        }
        None
    }
}

fn truncate_to_minute(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date().and_hms_opt(dt.hour(), dt.minute(), 0).unwrap_or(dt)
}

fn truncate_to_hour(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date().and_hms_opt(dt.hour(), 0, 0).unwrap_or(dt)
}

fn first_of_next_month(dt: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if dt.month() == 12 { (dt.year() + 1, 1) } else { (dt.year(), dt.month() + 1) };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_time(NaiveTime::MIN))
}

/// Parse one cron field into a bitmask over `min..=max`.
fn parse_field(
    text: &str,
    field: &'static str,
    min: u32,
    max: u32,
    names: &[&str],
) -> Result<u64, CronParseError> {
    let bad = || CronParseError::BadField { field, text: text.to_string() };

    let mut mask: u64 = 0;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(bad());
        }
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| bad())?;
                if step == 0 {
                    return Err(bad());
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, field, min, max, names)?, parse_value(b, field, min, max, names)?)
        } else {
            let v = parse_value(range, field, min, max, names)?;
            // A bare value with a step means "value to max", per cron.
            if step > 1 { (v, max) } else { (v, v) }
        };
        if lo > hi {
            return Err(bad());
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1 << normalize(v, field);
            v += step;
        }
    }
    Ok(mask)
}

fn parse_value(
    text: &str,
    field: &'static str,
    min: u32,
    max: u32,
    names: &[&str],
) -> Result<u32, CronParseError> {
    let value = if let Ok(n) = text.parse::<u32>() {
        n
    } else {
        // Names index from the field minimum: jan = 1, sun = 0.
        let lower = text.to_ascii_lowercase();
        names
            .iter()
            .position(|n| *n == lower)
            .map(|i| i as u32 + min)
            .ok_or(CronParseError::BadField { field, text: text.to_string() })?
    };
    if value < min || value > max {
        return Err(CronParseError::OutOfRange { field, value, min, max });
    }
    Ok(value)
}

/// Day-of-week 7 is an alias for Sunday (0).
fn normalize(value: u32, field: &'static str) -> u32 {
    if field == "day-of-week" && value == 7 {
        0
    } else {
        value
    }
}

#[cfg(test)]
#[path = "cron_tests.rs"]
mod tests;
