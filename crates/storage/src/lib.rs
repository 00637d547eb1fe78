// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! warden-storage: durable persistence for the warden daemon.
//!
//! Declared state (workloads, policies, schedules) lives in an
//! event-sourced write-ahead log compacted into zstd snapshots. Output
//! logs and metric samples live in per-workload append-only JSONL files.
//! The [`StoreGateway`] is the single writer handle over all of it.

mod gateway;
mod logstore;
mod snapshot;
mod state;
mod wal;

pub use gateway::{StoreGateway, StoreHealth, StoreOpenError, StorePaths};
pub use logstore::{LogQuery, LogStore, PurgeCutoff};
pub use snapshot::{load_snapshot, save_snapshot, Snapshot, SnapshotError, SNAPSHOT_VERSION};
pub use state::MaterializedState;
pub use wal::{Wal, WalEntry, WalError};
