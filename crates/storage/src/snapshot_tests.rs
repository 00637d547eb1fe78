// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tempfile::tempdir;
use warden_core::test_support::workload;
use warden_core::Event;

#[test]
fn missing_snapshot_is_none() {
    let dir = tempdir().unwrap();
    assert!(load_snapshot(&dir.path().join("state.snapshot")).unwrap().is_none());
}

#[test]
fn save_load_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.snapshot");

    let mut state = MaterializedState::default();
    let w = workload("svc", &["/bin/sh", "-c", "true"]);
    state.apply_event(&Event::WorkloadCreated { workload: w.clone() });

    save_snapshot(&path, &Snapshot::new(7, state)).unwrap();

    let loaded = load_snapshot(&path).unwrap().unwrap();
    assert_eq!(loaded.version, SNAPSHOT_VERSION);
    assert_eq!(loaded.seq, 7);
    assert_eq!(loaded.state.get_workload(w.id.as_str()), Some(&w));
}

#[test]
fn overwrite_replaces_previous() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.snapshot");

    save_snapshot(&path, &Snapshot::new(1, MaterializedState::default())).unwrap();
    save_snapshot(&path, &Snapshot::new(2, MaterializedState::default())).unwrap();

    assert_eq!(load_snapshot(&path).unwrap().unwrap().seq, 2);
}

#[test]
fn newer_version_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.snapshot");

    let mut snapshot = Snapshot::new(1, MaterializedState::default());
    snapshot.version = SNAPSHOT_VERSION + 1;
    save_snapshot(&path, &snapshot).unwrap();

    assert!(matches!(load_snapshot(&path), Err(SnapshotError::Version { .. })));
}

#[test]
fn garbage_file_is_an_error_not_a_panic() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.snapshot");
    std::fs::write(&path, b"not a snapshot").unwrap();
    assert!(load_snapshot(&path).is_err());
}
