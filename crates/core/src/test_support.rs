// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for tests in this crate and downstream crates.

use crate::policy::RestartPolicy;
use crate::workload::{Workload, WorkloadId};
use std::collections::BTreeMap;

/// A minimal valid workload with a fresh id.
pub fn workload(name: &str, argv: &[&str]) -> Workload {
    Workload {
        id: WorkloadId::generate(),
        name: name.to_string(),
        argv: argv.iter().map(|s| s.to_string()).collect(),
        cwd: None,
        env: BTreeMap::new(),
        group: None,
        policy: None,
        schedules: Vec::new(),
        created_at_ms: 0,
        updated_at_ms: 0,
    }
}

/// A bounded-retry policy with millisecond-scale delays, suitable for
/// driving real backoff in tests without real waits.
pub fn fast_retry_policy(max_retries: u32) -> RestartPolicy {
    RestartPolicy {
        name: "fast-retry".to_string(),
        max_retries,
        initial_delay_ms: 20,
        multiplier: 2.0,
        max_delay_ms: 200,
        restart_on_exit_codes: Default::default(),
        restart_on_success: false,
        restart_on_lost: false,
    }
}
