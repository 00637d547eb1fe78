// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-workload append-only log and metric files.
//!
//! One JSONL file per workload for output lines, a sibling for metric
//! samples. Log sequence numbers are assigned here on append: strictly
//! increasing and contiguous per workload, except across an explicit
//! purge. These files are never read on the hot path; queries exist for
//! external consumers.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use warden_core::{LogRecord, LogStream, MetricSample};

/// Filter for log queries. All fields combine conjunctively.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub since_ms: Option<u64>,
    pub until_ms: Option<u64>,
    pub stream: Option<LogStream>,
    /// Substring match on the payload.
    pub grep: Option<String>,
    /// Keep only the last N matching records.
    pub tail: Option<usize>,
}

impl LogQuery {
    fn matches(&self, record: &LogRecord) -> bool {
        if let Some(since) = self.since_ms {
            if record.at_ms < since {
                return false;
            }
        }
        if let Some(until) = self.until_ms {
            if record.at_ms > until {
                return false;
            }
        }
        if let Some(stream) = self.stream {
            if record.stream != stream {
                return false;
            }
        }
        if let Some(ref needle) = self.grep {
            if !record.payload.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Truncation point for [`LogStore::purge_before`].
#[derive(Debug, Clone, Copy)]
pub enum PurgeCutoff {
    /// Drop records with `seq < n`.
    Seq(u64),
    /// Drop records with `at_ms < t`.
    Time(u64),
}

pub struct LogStore {
    dir: PathBuf,
    /// Next log seq per workload, recovered lazily from file tails.
    next_seqs: Mutex<HashMap<String, u64>>,
}

impl LogStore {
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf(), next_seqs: Mutex::new(HashMap::new()) })
    }

    fn log_path(&self, workload: &str) -> PathBuf {
        self.dir.join(format!("{workload}.log.jsonl"))
    }

    fn metric_path(&self, workload: &str) -> PathBuf {
        self.dir.join(format!("{workload}.metrics.jsonl"))
    }

    /// Append a batch, assigning sequence numbers in order. Returns the
    /// last assigned seq.
    pub fn append_logs(&self, workload: &str, records: &mut [LogRecord]) -> std::io::Result<u64> {
        let path = self.log_path(workload);
        let mut seqs = self.next_seqs.lock();
        let next = match seqs.get(workload) {
            Some(n) => *n,
            None => last_log_seq(&path)? + 1,
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        let mut seq = next;
        for record in records.iter_mut() {
            record.seq = seq;
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
            seq += 1;
        }
        writer.flush()?;

        seqs.insert(workload.to_string(), seq);
        Ok(seq - 1)
    }

    pub fn append_metrics(
        &self,
        workload: &str,
        samples: &[MetricSample],
    ) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(self.metric_path(workload))?;
        let mut writer = BufWriter::new(file);
        for sample in samples {
            serde_json::to_writer(&mut writer, sample)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()
    }

    /// Stream the log file through the query filter without loading the
    /// whole file.
    pub fn query_logs(&self, workload: &str, query: &LogQuery) -> std::io::Result<Vec<LogRecord>> {
        let file = match File::open(self.log_path(workload)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut tail: VecDeque<LogRecord> = VecDeque::new();
        let mut out: Vec<LogRecord> = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let Ok(record) = serde_json::from_str::<LogRecord>(&line) else {
                continue;
            };
            if !query.matches(&record) {
                continue;
            }
            match query.tail {
                Some(n) => {
                    if tail.len() == n {
                        tail.pop_front();
                    }
                    tail.push_back(record);
                }
                None => out.push(record),
            }
        }
        if query.tail.is_some() {
            out.extend(tail);
        }
        Ok(out)
    }

    pub fn query_metrics(
        &self,
        workload: &str,
        since_ms: Option<u64>,
        until_ms: Option<u64>,
    ) -> std::io::Result<Vec<MetricSample>> {
        let file = match File::open(self.metric_path(workload)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let Ok(sample) = serde_json::from_str::<MetricSample>(&line) else {
                continue;
            };
            if since_ms.is_some_and(|s| sample.at_ms < s) {
                continue;
            }
            if until_ms.is_some_and(|u| sample.at_ms > u) {
                continue;
            }
            out.push(sample);
        }
        Ok(out)
    }

    /// Truncate the log file below a cutoff. Returns the number of
    /// records removed.
    pub fn purge_before(&self, workload: &str, cutoff: PurgeCutoff) -> std::io::Result<u64> {
        self.rewrite_logs(workload, |record| match cutoff {
            PurgeCutoff::Seq(n) => record.seq >= n,
            PurgeCutoff::Time(t) => record.at_ms >= t,
        })
    }

    /// Apply the retention policy to one workload's logs and metrics.
    /// Returns the number of log records removed.
    pub fn enforce_retention(
        &self,
        workload: &str,
        max_age_ms: u64,
        max_records: u64,
        now_ms: u64,
    ) -> std::io::Result<u64> {
        let oldest_allowed = now_ms.saturating_sub(max_age_ms);

        // Age first, then count: records that survive the age cut are
        // trimmed from the front down to the cap.
        let kept = self.count_logs_matching(workload, |r| r.at_ms >= oldest_allowed)?;
        let skip = kept.saturating_sub(max_records);
        let mut seen = 0u64;
        let removed = self.rewrite_logs(workload, |record| {
            if record.at_ms < oldest_allowed {
                return false;
            }
            seen += 1;
            seen > skip
        })?;

        // Metrics only have the age dimension.
        self.rewrite_metrics(workload, |sample| sample.at_ms >= oldest_allowed)?;
        Ok(removed)
    }

    /// Remove both files for a deleted workload.
    pub fn remove(&self, workload: &str) -> std::io::Result<()> {
        for path in [self.log_path(workload), self.metric_path(workload)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        self.next_seqs.lock().remove(workload);
        Ok(())
    }

    fn count_logs_matching(
        &self,
        workload: &str,
        mut keep: impl FnMut(&LogRecord) -> bool,
    ) -> std::io::Result<u64> {
        let records = self.query_logs(workload, &LogQuery::default())?;
        Ok(records.iter().filter(|r| keep(r)).count() as u64)
    }

    fn rewrite_logs(
        &self,
        workload: &str,
        mut keep: impl FnMut(&LogRecord) -> bool,
    ) -> std::io::Result<u64> {
        let path = self.log_path(workload);
        if !path.exists() {
            return Ok(0);
        }
        // Hold the seq lock across the rewrite so appends cannot race
        // the rename.
        let _guard = self.next_seqs.lock();

        let tmp = path.with_extension("jsonl.tmp");
        let mut removed = 0u64;
        {
            let reader = BufReader::new(File::open(&path)?);
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for line in reader.lines() {
                let line = line?;
                match serde_json::from_str::<LogRecord>(&line) {
                    Ok(record) if keep(&record) => {
                        writer.write_all(line.as_bytes())?;
                        writer.write_all(b"\n")?;
                    }
                    Ok(_) => removed += 1,
                    Err(_) => removed += 1,
                }
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(removed)
    }

    fn rewrite_metrics(
        &self,
        workload: &str,
        mut keep: impl FnMut(&MetricSample) -> bool,
    ) -> std::io::Result<()> {
        let path = self.metric_path(workload);
        if !path.exists() {
            return Ok(());
        }
        let tmp = path.with_extension("jsonl.tmp");
        {
            let reader = BufReader::new(File::open(&path)?);
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for line in reader.lines() {
                let line = line?;
                match serde_json::from_str::<MetricSample>(&line) {
                    Ok(sample) if keep(&sample) => {
                        writer.write_all(line.as_bytes())?;
                        writer.write_all(b"\n")?;
                    }
                    _ => {}
                }
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &path)
    }
}

/// Seq of the last record in a log file, 0 when absent or empty.
fn last_log_seq(path: &Path) -> std::io::Result<u64> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut last = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Ok(record) = serde_json::from_str::<LogRecord>(&line) {
            last = record.seq;
        }
    }
    Ok(last)
}

#[cfg(test)]
#[path = "logstore_tests.rs"]
mod tests;
