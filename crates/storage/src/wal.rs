// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only write-ahead log of events.
//!
//! One JSON object per line: `{"seq": N, "event": {...}}`. Sequence
//! numbers are strictly increasing; a snapshot records the last seq it
//! covers, and replay resumes after it. A torn final line (crash during
//! write) is truncated on open rather than failing recovery.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use warden_core::Event;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAL encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub event: Event,
}

pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    write_seq: u64,
}

impl Wal {
    /// Open (or create) the WAL, scanning existing entries to find the
    /// last sequence number. Entries at or below `snapshot_seq` are
    /// already covered by a snapshot and only matter for numbering.
    pub fn open(path: &Path, snapshot_seq: u64) -> Result<Self, WalError> {
        let mut last_seq = snapshot_seq;
        let mut good_len: u64 = 0;
        let mut truncate_needed = false;

        match File::open(path) {
            Ok(file) => {
                let mut reader = BufReader::new(file);
                let mut line = String::new();
                loop {
                    line.clear();
                    let n = reader.read_line(&mut line)?;
                    if n == 0 {
                        break;
                    }
                    match serde_json::from_str::<WalEntry>(line.trim_end()) {
                        Ok(entry) if line.ends_with('\n') => {
                            last_seq = last_seq.max(entry.seq);
                            good_len += n as u64;
                        }
                        _ => {
                            // Torn or corrupt tail: everything before it
                            // is intact, drop the rest.
                            tracing::warn!(
                                path = %path.display(),
                                offset = good_len,
                                "truncating corrupt WAL tail"
                            );
                            truncate_needed = true;
                            break;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if truncate_needed {
            file.set_len(good_len)?;
            file.seek(SeekFrom::End(0))?;
        }

        Ok(Self { writer: BufWriter::new(file), path: path.to_path_buf(), write_seq: last_seq })
    }

    /// Append an event, returning its sequence number. Buffered; call
    /// [`flush`](Self::flush) to make it durable.
    pub fn append(&mut self, event: &Event) -> Result<u64, WalError> {
        let seq = self.write_seq + 1;
        let entry = WalEntry { seq, event: event.clone() };
        serde_json::to_writer(&mut self.writer, &entry)?;
        self.writer.write_all(b"\n")?;
        self.write_seq = seq;
        Ok(seq)
    }

    pub fn flush(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    /// Read all entries with `seq > after`, in order.
    pub fn entries_after(&self, after: u64) -> Result<Vec<WalEntry>, WalError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(&line) {
                Ok(entry) if entry.seq > after => entries.push(entry),
                Ok(_) => {}
                // Torn tail is handled on open; reads just stop there.
                Err(_) => break,
            }
        }
        Ok(entries)
    }

    /// Drop entries already covered by a snapshot at `upto`. Rewrites
    /// the file atomically; sequence numbering continues unchanged.
    pub fn compact(&mut self, upto: u64) -> Result<(), WalError> {
        self.flush()?;
        let keep = self.entries_after(upto)?;

        let tmp = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for entry in &keep {
                serde_json::to_writer(&mut writer, entry)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }
}

#[cfg(test)]
#[path = "wal_tests.rs"]
mod tests;
