// Copyright 2025 Runtrace Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Size-rotated trace files
//!
//! Segments are `output.robolog`, `output_2.robolog`, ... inside one
//! output directory. When the live set exceeds the configured count the
//! oldest segment is deleted, strictly FIFO, so the directory holds a
//! bounded sliding window over the run.

use crate::error::{Result, SinkError};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Parse a human size spec: plain bytes, or `kb`/`mb`/`gb` suffixed
/// (case-insensitive), e.g. `"1MB"`, `"500kb"`, `"20480"`.
pub fn parse_size(spec: &str) -> Result<u64> {
    let spec = spec.trim();
    let lowered = spec.to_lowercase();
    let (number, multiplier) = if let Some(n) = lowered.strip_suffix("kb") {
        (n, 1024u64)
    } else if let Some(n) = lowered.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = lowered.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else {
        (lowered.as_str(), 1)
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| SinkError::InvalidSize(spec.to_string()))?;
    Ok(value * multiplier)
}

/// A directory of size-bounded trace segments.
pub struct RotatingFileSink {
    dir: PathBuf,
    max_bytes: u64,
    max_files: usize,
    writer: BufWriter<File>,
    current_bytes: u64,
    part: i64,
    segments: VecDeque<PathBuf>,
}

impl RotatingFileSink {
    /// Open the first segment. The directory is created if missing.
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64, max_files: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = segment_path(&dir, 1);
        let writer = BufWriter::new(File::create(&path)?);
        let mut segments = VecDeque::new();
        segments.push_back(path);
        Ok(Self {
            dir,
            max_bytes,
            max_files: max_files.max(1),
            writer,
            current_bytes: 0,
            part: 1,
            segments,
        })
    }

    /// 1-based index of the segment currently being written.
    pub fn part(&self) -> i64 {
        self.part
    }

    /// Whether writing `incoming` more bytes should go to a fresh
    /// segment. A single oversized write never rotates an empty
    /// segment: it would rotate forever.
    pub fn needs_rotation(&self, incoming: usize) -> bool {
        self.current_bytes > 0 && self.current_bytes + incoming as u64 > self.max_bytes
    }

    /// Close the current segment and open the next, evicting the oldest
    /// segments beyond the configured count.
    pub fn rotate(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.part += 1;
        let path = segment_path(&self.dir, self.part);
        debug!(part = self.part, path = %path.display(), "rotating trace segment");
        self.writer = BufWriter::new(File::create(&path)?);
        self.current_bytes = 0;
        self.segments.push_back(path);
        while self.segments.len() > self.max_files {
            // Oldest first, unconditionally.
            if let Some(evicted) = self.segments.pop_front() {
                info!(path = %evicted.display(), "evicting oldest trace segment");
                fs::remove_file(&evicted)?;
            }
        }
        Ok(())
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.current_bytes += line.len() as u64 + 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Paths of the live segments, oldest first.
    pub fn segments(&self) -> Vec<PathBuf> {
        self.segments.iter().cloned().collect()
    }
}

fn segment_path(dir: &Path, part: i64) -> PathBuf {
    if part == 1 {
        dir.join("output.robolog")
    } else {
        dir.join(format!("output_{part}.robolog"))
    }
}
