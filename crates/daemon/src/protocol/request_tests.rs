// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn tagged_serde_roundtrip() {
    let request = Request::CreateWorkload {
        name: "svc".to_string(),
        argv: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
        cwd: None,
        env: BTreeMap::from([("KEY".to_string(), "v".to_string())]),
        group: None,
        policy: Some("retry".to_string()),
        schedules: vec![(ScheduleKind::Interval, "2s".to_string())],
    };
    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(json["type"], "CreateWorkload");

    let back: Request = serde_json::from_value(json).unwrap();
    assert_eq!(back, request);
}

#[test]
fn omitted_defaults_deserialize() {
    let request: Request = serde_json::from_str(
        r#"{"type": "CreateWorkload", "name": "w", "argv": ["/bin/true"]}"#,
    )
    .unwrap();
    match request {
        Request::CreateWorkload { env, schedules, policy, .. } => {
            assert!(env.is_empty());
            assert!(schedules.is_empty());
            assert!(policy.is_none());
        }
        other => panic!("unexpected request: {other:?}"),
    }
}

#[test]
fn put_schedule_enabled_defaults_true() {
    let request: Request = serde_json::from_str(
        r#"{"type": "PutSchedule", "id": "wl-a", "kind": "cron", "expression": "*/5 * * * *"}"#,
    )
    .unwrap();
    match request {
        Request::PutSchedule { enabled, kind, .. } => {
            assert!(enabled);
            assert_eq!(kind, ScheduleKind::Cron);
        }
        other => panic!("unexpected request: {other:?}"),
    }
}

#[test]
fn stop_carries_wire_duration() {
    let request: Request =
        serde_json::from_str(r#"{"type": "Stop", "id": "wl-a", "grace": "1h30m"}"#).unwrap();
    assert_eq!(
        request,
        Request::Stop { id: "wl-a".to_string(), grace: Some("1h30m".to_string()), force: false }
    );
}
