// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

const HOUR_MS: u64 = 3_600_000;

fn sched(spec: ScheduleSpec) -> Schedule {
    Schedule::new(WorkloadId::generate(), spec, true)
}

#[test]
fn validate_cron_expression() {
    assert!(sched(ScheduleSpec::Cron { expr: "*/5 * * * *".into() }).validate(0).is_ok());
    let err = sched(ScheduleSpec::Cron { expr: "not cron".into() }).validate(0).unwrap_err();
    assert_eq!(err.kind, crate::error::ErrorKind::InvalidExpression);
}

#[test]
fn validate_interval_and_once() {
    assert!(sched(ScheduleSpec::Interval { every_ms: 2000 }).validate(0).is_ok());
    assert!(sched(ScheduleSpec::Interval { every_ms: 0 }).validate(0).is_err());
    assert!(sched(ScheduleSpec::Once { at_ms: 10_000 }).validate(5_000).is_ok());
    assert!(sched(ScheduleSpec::Once { at_ms: 10_000 }).validate(10_000).is_err());
}

#[test]
fn interval_first_fire_is_one_period_out() {
    let s = sched(ScheduleSpec::Interval { every_ms: 2000 });
    assert_eq!(s.next_fire_after(1_000_000, &chrono_tz::UTC), Some(1_002_000));
}

#[test]
fn interval_advances_from_last_fire() {
    let mut s = sched(ScheduleSpec::Interval { every_ms: 2000 });
    s.last_fire_ms = Some(1_000_000);
    assert_eq!(s.next_fire_after(1_000_500, &chrono_tz::UTC), Some(1_002_000));
}

#[test]
fn interval_does_not_burst_after_clock_jump() {
    let mut s = sched(ScheduleSpec::Interval { every_ms: 2000 });
    s.last_fire_ms = Some(1_000_000);
    // Far past the missed fires: exactly one period from now.
    assert_eq!(s.next_fire_after(1_000_000 + 10 * HOUR_MS, &chrono_tz::UTC), Some(1_000_000 + 10 * HOUR_MS + 2000));
}

#[test]
fn once_fires_then_never_again() {
    let mut s = sched(ScheduleSpec::Once { at_ms: 2_000_000 });
    assert_eq!(s.next_fire_after(1_000_000, &chrono_tz::UTC), Some(2_000_000));

    s.mark_fired(2_000_000, &chrono_tz::UTC);
    assert!(!s.enabled);
    assert_eq!(s.next_fire_ms, None);
    assert_eq!(s.next_fire_after(2_000_001, &chrono_tz::UTC), None);
}

#[test]
fn mark_fired_recomputes_interval() {
    let mut s = sched(ScheduleSpec::Interval { every_ms: 2000 });
    s.mark_fired(1_000_000, &chrono_tz::UTC);
    assert_eq!(s.last_fire_ms, Some(1_000_000));
    assert_eq!(s.next_fire_ms, Some(1_002_000));
    assert!(s.enabled);
}

#[test]
fn cron_next_fire_in_utc() {
    // 1_700_000_000_000 ms = 2023-11-14 22:13:20 UTC.
    let s = sched(ScheduleSpec::Cron { expr: "0 23 * * *".into() });
    let next = s.next_fire_after(1_700_000_000_000, &chrono_tz::UTC).unwrap();
    // 2023-11-14 23:00:00 UTC.
    assert_eq!(next, 1_700_002_800_000);
}

#[test]
fn serde_flattens_kind() {
    let s = sched(ScheduleSpec::Interval { every_ms: 2000 });
    let json = serde_json::to_value(&s).unwrap();
    assert_eq!(json["kind"], "interval");
    assert_eq!(json["every_ms"], 2000);
    let back: Schedule = serde_json::from_value(json).unwrap();
    assert_eq!(back, s);
}

#[test]
fn enable_disable_is_equivalent_to_put_for_future_firings() {
    // Same next-fire computation whether or not the schedule spent time
    // disabled in between, given the same last_fire.
    let mut a = sched(ScheduleSpec::Interval { every_ms: 2000 });
    a.last_fire_ms = Some(1_000_000);
    let mut b = a.clone();
    b.enabled = false;
    b.enabled = true;
    assert_eq!(
        a.next_fire_after(1_001_000, &chrono_tz::UTC),
        b.next_fire_after(1_001_000, &chrono_tz::UTC)
    );
}
