// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State snapshots: zstd-compressed JSON, written atomically.
//!
//! A snapshot bounds WAL replay on startup: load the snapshot, then
//! apply only the WAL entries after its sequence number.

use crate::state::MaterializedState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const SNAPSHOT_VERSION: u32 = 1;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("snapshot version {found} is newer than supported {supported}")]
    Version { found: u32, supported: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Last WAL sequence number this snapshot covers.
    pub seq: u64,
    pub state: MaterializedState,
}

impl Snapshot {
    pub fn new(seq: u64, state: MaterializedState) -> Self {
        Self { version: SNAPSHOT_VERSION, seq, state }
    }
}

/// Write a snapshot next to its final path, then rename into place.
pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let json = serde_json::to_vec(snapshot)?;
    let compressed = zstd::stream::encode_all(json.as_slice(), ZSTD_LEVEL)?;

    let tmp = path.with_extension("snapshot.tmp");
    std::fs::write(&tmp, &compressed)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a snapshot; `Ok(None)` when none exists yet.
pub fn load_snapshot(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    let compressed = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let json = zstd::stream::decode_all(compressed.as_slice())?;
    let snapshot: Snapshot = serde_json::from_slice(&json)?;
    if snapshot.version > SNAPSHOT_VERSION {
        return Err(SnapshotError::Version { found: snapshot.version, supported: SNAPSHOT_VERSION });
    }
    Ok(Some(snapshot))
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
