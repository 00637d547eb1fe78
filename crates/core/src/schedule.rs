// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Schedule declarations: cron, fixed interval, one-shot.

use crate::cron::CronExpr;
use crate::error::ControlError;
use crate::workload::WorkloadId;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Stable identifier of a schedule.
    pub struct ScheduleId("sch-");
}

/// The timing rule of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Five-field cron expression, evaluated in the daemon timezone.
    Cron { expr: String },
    /// Fixed interval between fires.
    Interval { every_ms: u64 },
    /// Fires once at a wall-clock instant, then disables itself.
    Once { at_ms: u64 },
}

impl ScheduleSpec {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ScheduleSpec::Cron { .. } => "cron",
            ScheduleSpec::Interval { .. } => "interval",
            ScheduleSpec::Once { .. } => "once",
        }
    }
}

/// A named association of a timing rule to a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub workload: WorkloadId,
    #[serde(flatten)]
    pub spec: ScheduleSpec,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fire_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_ms: Option<u64>,
}

impl Schedule {
    pub fn new(workload: WorkloadId, spec: ScheduleSpec, enabled: bool) -> Self {
        Self {
            id: ScheduleId::generate(),
            workload,
            spec,
            enabled,
            last_fire_ms: None,
            next_fire_ms: None,
        }
    }

    /// Validate the expression against `now` (cron must parse; interval
    /// must be positive; a one-shot instant must be in the future).
    pub fn validate(&self, now_ms: u64) -> Result<(), ControlError> {
        match &self.spec {
            ScheduleSpec::Cron { expr } => {
                expr.parse::<CronExpr>()
                    .map_err(|e| ControlError::invalid_expression(e.to_string()))?;
            }
            ScheduleSpec::Interval { every_ms } => {
                if *every_ms == 0 {
                    return Err(ControlError::invalid_expression(
                        "interval must be greater than zero",
                    ));
                }
            }
            ScheduleSpec::Once { at_ms } => {
                if *at_ms <= now_ms {
                    return Err(ControlError::invalid_expression(
                        "one-shot instant must be in the future",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Compute the next fire instant strictly after `now_ms`.
    ///
    /// - Cron: next matching wall-clock instant in `tz`.
    /// - Interval: `last_fire + interval`; when that already passed
    ///   (clock jump, backlog) the schedule fires once and advances to
    ///   `now + interval` — no burst catch-up.
    /// - One-shot: the instant, until it has fired.
    ///
    /// Returns `None` when the schedule can never fire again.
    pub fn next_fire_after(&self, now_ms: u64, tz: &Tz) -> Option<u64> {
        match &self.spec {
            ScheduleSpec::Cron { expr } => {
                let parsed: CronExpr = expr.parse().ok()?;
                let now = epoch_ms_to_utc(now_ms)?;
                parsed.next_after(now, tz).map(|t| t.timestamp_millis() as u64)
            }
            ScheduleSpec::Interval { every_ms } => {
                let base = self.last_fire_ms.unwrap_or(now_ms);
                let next = base.saturating_add(*every_ms);
                Some(if next <= now_ms { now_ms + every_ms } else { next })
            }
            ScheduleSpec::Once { at_ms } => {
                if self.last_fire_ms.is_some() {
                    None
                } else {
                    Some(*at_ms)
                }
            }
        }
    }

    /// Record a fire at `now_ms` and recompute `next_fire_ms`.
    /// One-shots disable themselves.
    pub fn mark_fired(&mut self, now_ms: u64, tz: &Tz) {
        self.last_fire_ms = Some(now_ms);
        if matches!(self.spec, ScheduleSpec::Once { .. }) {
            self.enabled = false;
        }
        self.next_fire_ms = if self.enabled { self.next_fire_after(now_ms, tz) } else { None };
    }
}

fn epoch_ms_to_utc(ms: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms as i64).single()
}

#[cfg(test)]
#[path = "schedule_tests.rs"]
mod tests;
