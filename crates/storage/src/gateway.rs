// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Store Gateway: single writer handle over all durable state.
//!
//! Declared-state mutations (workloads, policies, schedules) append to
//! the WAL synchronously and fail the calling command with
//! `StoreUnavailable`. Runtime audit events (phase changes, run
//! milestones) go through a bounded outbox that retries in the
//! background — liveness over durability. Log and metric records flow
//! through an in-memory pipeline that batches writes, drops oldest on
//! overflow, and raises the `persistence_lag` health signal after three
//! consecutive flush failures.

use crate::logstore::{LogQuery, LogStore, PurgeCutoff};
use crate::snapshot::{load_snapshot, save_snapshot, Snapshot, SnapshotError};
use crate::state::MaterializedState;
use crate::wal::{Wal, WalError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use warden_core::{
    ControlError, DaemonConfig, Event, LogRecord, MetricSample, RestartPolicy, Schedule, Workload,
};

/// Runtime events kept while the WAL is unavailable.
const OUTBOX_MAX: usize = 1024;

/// Consecutive flush failures before `persistence_lag` is raised.
const LAG_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHealth {
    pub persistence_lag: bool,
    /// Records buffered in memory awaiting a flush.
    pub pending: usize,
    /// Records dropped since startup (queue overflow).
    pub dropped: u64,
}

#[derive(Debug, Clone)]
pub struct StorePaths {
    pub wal: PathBuf,
    pub snapshot: PathBuf,
    pub logs_dir: PathBuf,
}

impl StorePaths {
    pub fn under(state_dir: &Path) -> Self {
        Self {
            wal: state_dir.join("events.wal"),
            snapshot: state_dir.join("state.snapshot"),
            logs_dir: state_dir.join("logs"),
        }
    }
}

struct Declared {
    wal: Wal,
    state: MaterializedState,
}

enum PipeMsg {
    Log(LogRecord),
    Metric(MetricSample),
}

pub struct StoreGateway {
    declared: Mutex<Declared>,
    logs: LogStore,
    snapshot_path: PathBuf,
    config: DaemonConfig,
    pipe_tx: mpsc::Sender<PipeMsg>,
    pipe_rx: Mutex<Option<mpsc::Receiver<PipeMsg>>>,
    /// Live-stream side channel for store health events.
    events_tx: mpsc::Sender<Event>,
    outbox: Mutex<VecDeque<Event>>,
    pending: AtomicUsize,
    dropped: AtomicU64,
    lagging: Mutex<LagState>,
}

#[derive(Default)]
struct LagState {
    consecutive_failures: u32,
    raised: bool,
    retry_at: Option<std::time::Instant>,
}

impl StoreGateway {
    /// Open the store: load the snapshot, replay the WAL tail, and
    /// prepare the append pipeline. Call [`run_pipeline`](Self::run_pipeline)
    /// on the returned gateway to start batched writes.
    pub fn open(
        paths: &StorePaths,
        config: DaemonConfig,
        events_tx: mpsc::Sender<Event>,
    ) -> Result<Arc<Self>, StoreOpenError> {
        let (snapshot_seq, mut state) = match load_snapshot(&paths.snapshot)? {
            Some(snapshot) => {
                tracing::info!(
                    seq = snapshot.seq,
                    workloads = snapshot.state.workloads.len(),
                    "loaded snapshot"
                );
                (snapshot.seq, snapshot.state)
            }
            None => {
                tracing::info!("no snapshot found, starting with empty state");
                (0, MaterializedState::default())
            }
        };

        let wal = Wal::open(&paths.wal, snapshot_seq)?;
        let replay = wal.entries_after(snapshot_seq)?;
        if !replay.is_empty() {
            tracing::info!(count = replay.len(), after = snapshot_seq, "replaying WAL entries");
        }
        for entry in &replay {
            state.apply_event(&entry.event);
        }

        let logs = LogStore::open(&paths.logs_dir)?;
        let (pipe_tx, pipe_rx) = mpsc::channel(config.log_queue_max.max(1));

        Ok(Arc::new(Self {
            declared: Mutex::new(Declared { wal, state }),
            logs,
            snapshot_path: paths.snapshot.clone(),
            config,
            pipe_tx,
            pipe_rx: Mutex::new(Some(pipe_rx)),
            events_tx,
            outbox: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            lagging: Mutex::new(LagState::default()),
        }))
    }

    /// A clone of the recovered state, for startup reconciliation.
    pub fn recovered_state(&self) -> MaterializedState {
        self.declared.lock().state.clone()
    }

    // --- declared-state mutations (synchronous, atomic per call) ---

    /// Append a group of events and apply them. All-or-nothing with
    /// respect to the in-memory state; a failure surfaces as
    /// `StoreUnavailable` and leaves the registry untouched.
    pub fn record(&self, events: &[Event]) -> Result<(), ControlError> {
        let mut declared = self.declared.lock();
        for event in events {
            declared
                .wal
                .append(event)
                .map_err(|e| ControlError::store_unavailable(e.to_string()))?;
        }
        declared.wal.flush().map_err(|e| ControlError::store_unavailable(e.to_string()))?;
        for event in events {
            declared.state.apply_event(event);
            tracing::debug!(event = %event.log_summary(), "recorded");
        }
        Ok(())
    }

    pub fn upsert_workload(&self, workload: &Workload, created: bool) -> Result<(), ControlError> {
        let event = if created {
            Event::WorkloadCreated { workload: workload.clone() }
        } else {
            Event::WorkloadUpdated { workload: workload.clone() }
        };
        self.record(&[event])
    }

    pub fn delete_workload(&self, id: &str) -> Result<(), ControlError> {
        self.record(&[Event::WorkloadDeleted { id: id.into() }])?;
        if let Err(e) = self.logs.remove(id) {
            tracing::warn!(workload = id, error = %e, "failed to remove log files");
        }
        Ok(())
    }

    pub fn put_policy(&self, policy: &RestartPolicy) -> Result<(), ControlError> {
        self.record(&[Event::PolicyPut { policy: policy.clone() }])
    }

    pub fn put_schedule(&self, schedule: &Schedule) -> Result<(), ControlError> {
        self.record(&[Event::SchedulePut { schedule: schedule.clone() }])
    }

    // --- declared-state reads ---

    pub fn list_workloads(&self) -> Vec<Workload> {
        let declared = self.declared.lock();
        let mut workloads: Vec<Workload> = declared.state.workloads.values().cloned().collect();
        workloads.sort_by(|a, b| a.name.cmp(&b.name));
        workloads
    }

    pub fn load_policy(&self, name: &str) -> Option<RestartPolicy> {
        self.declared.lock().state.policies.get(name).cloned()
    }

    pub fn load_schedules(&self) -> Vec<Schedule> {
        self.declared.lock().state.schedules.values().cloned().collect()
    }

    pub fn load_schedule(&self, id: &str) -> Option<Schedule> {
        self.declared.lock().state.schedules.get(id).cloned()
    }

    pub fn schedules_for(&self, workload_id: &str) -> Vec<Schedule> {
        self.declared.lock().state.schedules_for(workload_id).into_iter().cloned().collect()
    }

    // --- runtime audit events (absorbed failures) ---

    /// Record a runtime event without blocking the state machine. On
    /// store failure the event is kept in a bounded outbox and retried
    /// by the pipeline; on overflow the oldest entries are dropped and a
    /// `store:dropped` signal is emitted.
    pub fn record_runtime(&self, event: &Event) {
        if !event.is_durable() {
            return;
        }
        let failed = {
            let mut declared = self.declared.lock();
            match declared.wal.append(event) {
                Ok(_) => {
                    declared.state.apply_event(event);
                    false
                }
                Err(_) => true,
            }
        };
        if failed {
            self.stash_in_outbox(event.clone());
        }
    }

    fn stash_in_outbox(&self, event: Event) {
        let mut outbox = self.outbox.lock();
        let mut dropped = 0u64;
        while outbox.len() >= OUTBOX_MAX {
            outbox.pop_front();
            dropped += 1;
        }
        outbox.push_back(event);
        drop(outbox);
        if dropped > 0 {
            tracing::warn!(dropped, "runtime event outbox overflow");
            let _ = self.events_tx.try_send(Event::PersistenceDropped { count: dropped });
        }
    }

    fn flush_outbox(&self) {
        loop {
            let Some(event) = self.outbox.lock().pop_front() else { break };
            let mut declared = self.declared.lock();
            if declared.wal.append(&event).is_err() {
                drop(declared);
                self.outbox.lock().push_front(event);
                break;
            }
            declared.state.apply_event(&event);
        }
    }

    // --- log / metric appends (never block the producer) ---

    pub fn append_log(&self, record: LogRecord) {
        match self.pipe_tx.try_send(PipeMsg::Log(record)) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn append_metric(&self, sample: MetricSample) {
        match self.pipe_tx.try_send(PipeMsg::Metric(sample)) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // --- queries (off the hot path) ---

    pub fn query_logs(&self, workload: &str, query: &LogQuery) -> Result<Vec<LogRecord>, ControlError> {
        self.logs
            .query_logs(workload, query)
            .map_err(|e| ControlError::store_unavailable(e.to_string()))
    }

    pub fn query_metrics(
        &self,
        workload: &str,
        since_ms: Option<u64>,
        until_ms: Option<u64>,
    ) -> Result<Vec<MetricSample>, ControlError> {
        self.logs
            .query_metrics(workload, since_ms, until_ms)
            .map_err(|e| ControlError::store_unavailable(e.to_string()))
    }

    pub fn purge_before(&self, workload: &str, cutoff: PurgeCutoff) -> Result<u64, ControlError> {
        self.logs
            .purge_before(workload, cutoff)
            .map_err(|e| ControlError::store_unavailable(e.to_string()))
    }

    // --- maintenance ---

    pub fn health(&self) -> StoreHealth {
        StoreHealth {
            persistence_lag: self.lagging.lock().raised,
            pending: self.pending.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Compact the WAL into a fresh snapshot.
    pub fn checkpoint(&self) -> Result<(), SnapshotError> {
        let (seq, state) = {
            let mut declared = self.declared.lock();
            if let Err(e) = declared.wal.flush() {
                tracing::warn!(error = %e, "WAL flush before checkpoint failed");
            }
            (declared.wal.write_seq(), declared.state.clone())
        };
        save_snapshot(&self.snapshot_path, &Snapshot::new(seq, state))?;
        if let Err(e) = self.declared.lock().wal.compact(seq) {
            tracing::warn!(error = %e, "WAL compaction failed");
        }
        tracing::info!(seq, "checkpoint written");
        Ok(())
    }

    /// Apply the retention policy to every known workload.
    pub fn run_retention(&self, now_ms: u64) {
        let max_age_ms = self
            .config
            .retention_max_age()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(30 * 86_400_000);
        let ids: Vec<String> =
            self.declared.lock().state.workloads.keys().cloned().collect();
        for id in ids {
            match self.logs.enforce_retention(&id, max_age_ms, self.config.retention_max_records, now_ms)
            {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(workload = %id, removed, "retention purge"),
                Err(e) => tracing::warn!(workload = %id, error = %e, "retention purge failed"),
            }
        }
    }

    /// Drive the append pipeline until shutdown. Consumes the receiver;
    /// callable once.
    pub async fn run_pipeline(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut rx) = self.pipe_rx.lock().take() else {
            tracing::error!("store pipeline started twice");
            return;
        };

        let mut logs: HashMap<String, VecDeque<LogRecord>> = HashMap::new();
        let mut metrics: HashMap<String, Vec<MetricSample>> = HashMap::new();
        let mut overflow: HashMap<String, u64> = HashMap::new();
        let mut tick = tokio::time::interval(self.config.log_flush_interval().max(Duration::from_millis(10)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush_all(&mut logs, &mut metrics);
                    self.flush_outbox();
                    if let Err(e) = self.declared.lock().wal.flush() {
                        tracing::warn!(error = %e, "final WAL flush failed");
                    }
                    break;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        PipeMsg::Log(record) => {
                            let key = record.workload.as_str().to_string();
                            let buf = logs.entry(key.clone()).or_default();
                            if buf.len() >= self.config.log_queue_max {
                                buf.pop_front();
                                *overflow.entry(key.clone()).or_default() += 1;
                                self.pending.fetch_sub(1, Ordering::Relaxed);
                            }
                            buf.push_back(record);
                            if buf.len() >= self.config.log_flush_batch {
                                self.flush_logs_for(&key, &mut logs);
                            }
                        }
                        PipeMsg::Metric(sample) => {
                            let key = sample.workload.as_str().to_string();
                            let buf = metrics.entry(key.clone()).or_default();
                            buf.push(sample);
                            if buf.len() >= self.config.log_flush_batch {
                                self.flush_metrics_for(&key, &mut metrics);
                            }
                        }
                    }
                }
                _ = tick.tick() => {
                    self.flush_all(&mut logs, &mut metrics);
                    self.flush_outbox();
                    if let Err(e) = self.declared.lock().wal.flush() {
                        tracing::warn!(error = %e, "periodic WAL flush failed");
                    }
                    self.report_overflow(&mut overflow);
                }
            }
        }
    }

    fn flush_all(
        &self,
        logs: &mut HashMap<String, VecDeque<LogRecord>>,
        metrics: &mut HashMap<String, Vec<MetricSample>>,
    ) {
        if let Some(retry_at) = self.lagging.lock().retry_at {
            if std::time::Instant::now() < retry_at {
                return;
            }
        }
        let keys: Vec<String> = logs.keys().cloned().collect();
        for key in keys {
            self.flush_logs_for(&key, logs);
        }
        let keys: Vec<String> = metrics.keys().cloned().collect();
        for key in keys {
            self.flush_metrics_for(&key, metrics);
        }
        logs.retain(|_, buf| !buf.is_empty());
        metrics.retain(|_, buf| !buf.is_empty());
    }

    fn flush_logs_for(&self, key: &str, logs: &mut HashMap<String, VecDeque<LogRecord>>) {
        let Some(buf) = logs.get_mut(key) else { return };
        if buf.is_empty() {
            return;
        }
        let mut batch: Vec<LogRecord> = buf.iter().cloned().collect();
        match self.logs.append_logs(key, &mut batch) {
            Ok(_) => {
                self.pending.fetch_sub(buf.len(), Ordering::Relaxed);
                buf.clear();
                self.note_flush_ok();
            }
            Err(e) => self.note_flush_err(key, &e),
        }
    }

    fn flush_metrics_for(&self, key: &str, metrics: &mut HashMap<String, Vec<MetricSample>>) {
        let Some(buf) = metrics.get_mut(key) else { return };
        if buf.is_empty() {
            return;
        }
        match self.logs.append_metrics(key, buf) {
            Ok(()) => {
                self.pending.fetch_sub(buf.len(), Ordering::Relaxed);
                buf.clear();
                self.note_flush_ok();
            }
            Err(e) => self.note_flush_err(key, &e),
        }
    }

    fn note_flush_ok(&self) {
        let mut lag = self.lagging.lock();
        lag.consecutive_failures = 0;
        lag.retry_at = None;
        if lag.raised {
            lag.raised = false;
            tracing::info!("persistence lag cleared");
        }
    }

    fn note_flush_err(&self, key: &str, error: &std::io::Error) {
        let mut lag = self.lagging.lock();
        lag.consecutive_failures += 1;
        // Exponential backoff before the next flush attempt, capped at 5s.
        let backoff = Duration::from_millis(
            100u64.saturating_mul(1 << lag.consecutive_failures.min(6)),
        )
        .min(Duration::from_secs(5));
        lag.retry_at = Some(std::time::Instant::now() + backoff);
        tracing::warn!(
            workload = key,
            failures = lag.consecutive_failures,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "log flush failed"
        );
        if lag.consecutive_failures >= LAG_THRESHOLD && !lag.raised {
            lag.raised = true;
            let pending = self.pending.load(Ordering::Relaxed);
            let failures = lag.consecutive_failures;
            drop(lag);
            let _ = self
                .events_tx
                .try_send(Event::PersistenceLag { pending, consecutive_failures: failures });
        }
    }

    fn report_overflow(&self, overflow: &mut HashMap<String, u64>) {
        for (workload, count) in overflow.drain() {
            self.dropped.fetch_add(count, Ordering::Relaxed);
            tracing::warn!(workload = %workload, count, "log queue overflow, oldest records dropped");
            let _ = self.events_tx.try_send(Event::LogDropped {
                workload: workload.as_str().into(),
                count,
            });
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreOpenError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("log store error: {0}")]
    Logs(#[from] std::io::Error),
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
