// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Line framing for captured output streams.
//!
//! Splits a byte stream on `\n` with a maximum line length. A line at
//! exactly the limit is one frame with no marker; one byte over splits
//! it, with the truncation marker on the first frame.

use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8192;

/// One framed line, lossily decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: String,
    pub truncated: bool,
}

pub struct LineReader<R> {
    reader: R,
    max_len: usize,
    acc: Vec<u8>,
    ready: VecDeque<Frame>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_len: usize) -> Self {
        Self { reader, max_len: max_len.max(1), acc: Vec::new(), ready: VecDeque::new(), eof: false }
    }

    /// Next frame, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            if self.eof {
                if self.acc.is_empty() {
                    return Ok(None);
                }
                // Final unterminated line.
                let acc = std::mem::take(&mut self.acc);
                self.push_frame(acc, false);
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                continue;
            }
            for &byte in &chunk[..n] {
                if byte == b'\n' {
                    let acc = std::mem::take(&mut self.acc);
                    self.push_frame(acc, false);
                } else {
                    if self.acc.len() == self.max_len {
                        // The next byte would overflow: split here.
                        let acc = std::mem::take(&mut self.acc);
                        self.push_frame(acc, true);
                    }
                    self.acc.push(byte);
                }
            }
        }
    }

    fn push_frame(&mut self, bytes: Vec<u8>, truncated: bool) {
        let payload = String::from_utf8_lossy(&bytes).into_owned();
        self.ready.push_back(Frame { payload, truncated });
    }
}

#[cfg(test)]
#[path = "output_tests.rs"]
mod tests;
