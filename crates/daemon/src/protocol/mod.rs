// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC protocol for daemon communication.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload.

mod request;
mod response;
mod wire;

pub use request::{Request, ScheduleKind};
pub use response::{HealthReport, Response, WorkloadDetail, WorkloadSummary};
pub use wire::{
    decode, encode, read_message, read_typed, write_message, write_typed, ProtocolError,
    MAX_FRAME_LEN,
};
