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

//! Line-oriented trace encoding
//!
//! Each event becomes one `TAG payload` line, fields joined by `|`.
//! Repeated strings are memoized: the first occurrence emits an
//! `M id:"value"` line and every field reference carries the id only.
//!
//! The table keeps a per-segment watermark so a rotating sink can start
//! a fresh segment and have every memo entry re-emitted there, keeping
//! each segment independently decodable.

use crate::error::Result;
use chrono::{DateTime, Utc};
use runtrace_core::LifecycleEvent;
use std::collections::HashMap;

/// Bumped whenever the encoded format changes incompatibly.
pub const DOC_VERSION: &str = "0.0.1";

/// String-interning table with sequential decimal ids.
#[derive(Debug, Default)]
pub struct MemoTable {
    ids: HashMap<String, u64>,
    ordered: Vec<(u64, String)>,
    written: usize,
}

impl MemoTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `value`, returning its id. Ids are stable for the life of
    /// the table, across segment resets.
    pub fn intern(&mut self, value: &str) -> u64 {
        if let Some(id) = self.ids.get(value) {
            return *id;
        }
        let id = self.ids.len() as u64 + 1;
        self.ids.insert(value.to_string(), id);
        self.ordered.push((id, value.to_string()));
        id
    }

    /// Append `M` lines for every entry not yet written in the current
    /// segment.
    fn drain_unwritten(&mut self, out: &mut Vec<String>) -> Result<()> {
        while self.written < self.ordered.len() {
            let (id, value) = &self.ordered[self.written];
            out.push(format!("M {id}:{}", serde_json::to_string(value)?));
            self.written += 1;
        }
        Ok(())
    }

    /// Forget what the current segment has seen; the next encode
    /// re-emits the whole table.
    pub fn reset_segment(&mut self) {
        self.written = 0;
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Encodes lifecycle events into wire lines.
pub struct Encoder {
    memo: MemoTable,
    initial_time: DateTime<Utc>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            memo: MemoTable::new(),
            initial_time: Utc::now(),
        }
    }

    pub fn initial_time(&self) -> DateTime<Utc> {
        self.initial_time
    }

    /// Segment preamble: version, initial time, and the segment's part
    /// number within this run. Every segment repeats it so each file
    /// decodes standalone.
    pub fn header(&self, part: i64, run_id: &str) -> Vec<String> {
        vec![
            format!("V {DOC_VERSION}"),
            format!(
                "T {}",
                self.initial_time.format("%Y-%m-%dT%H:%M:%S%.6f%:z")
            ),
            format!("ID {part}|{run_id}"),
        ]
    }

    /// Free-form metadata line (`I <json>`).
    pub fn info(&self, message: &str) -> Result<String> {
        Ok(format!("I {}", serde_json::to_string(message)?))
    }

    /// Start a fresh segment: the next [`Encoder::encode`] call
    /// re-emits the full memo table first.
    pub fn reset_segment(&mut self) {
        self.memo.reset_segment();
    }

    /// Encode one event, memo lines first.
    pub fn encode(&mut self, event: &LifecycleEvent) -> Result<Vec<String>> {
        let payload = self.payload(event);
        let mut lines = Vec::with_capacity(2);
        self.memo.drain_unwritten(&mut lines)?;
        lines.push(format!("{} {}", event.tag(), payload));
        Ok(lines)
    }

    fn oid(&mut self, value: &str) -> String {
        self.memo.intern(value).to_string()
    }

    fn payload(&mut self, event: &LifecycleEvent) -> String {
        use LifecycleEvent::*;
        match event {
            RunStart { name, time_delta } => {
                format!("{}|{}", self.oid(name), fmt_float(*time_delta))
            }
            RunEnd { status, time_delta } => {
                format!("{}|{}", self.oid(status.as_str()), fmt_float(*time_delta))
            }
            TaskStart {
                name,
                libname,
                source,
                lineno,
                time_delta,
            } => format!(
                "{}|{}|{}|{lineno}|{}",
                self.oid(name),
                self.oid(libname),
                self.oid(source),
                fmt_float(*time_delta)
            ),
            TaskEnd {
                status,
                message,
                time_delta,
            } => format!(
                "{}|{}|{}",
                self.oid(status.as_str()),
                self.oid(message),
                fmt_float(*time_delta)
            ),
            ElementStart {
                name,
                libname,
                kind,
                doc,
                source,
                lineno,
                time_delta,
            } => format!(
                "{}|{}|{}|{}|{}|{lineno}|{}",
                self.oid(name),
                self.oid(libname),
                self.oid(kind.as_str()),
                self.oid(doc),
                self.oid(source),
                fmt_float(*time_delta)
            ),
            ElementEnd {
                kind,
                status,
                time_delta,
            } => format!(
                "{}|{}|{}",
                self.oid(kind.as_str()),
                self.oid(status.as_str()),
                fmt_float(*time_delta)
            ),
            YieldSuspend {
                name,
                libname,
                source,
                lineno,
                type_name,
                value,
                time_delta,
            } => format!(
                "{}|{}|{}|{lineno}|{}|{}|{}",
                self.oid(name),
                self.oid(libname),
                self.oid(source),
                self.oid(type_name),
                self.oid(value),
                fmt_float(*time_delta)
            ),
            YieldResume {
                name,
                libname,
                source,
                lineno,
                time_delta,
            }
            | YieldFromSuspend {
                name,
                libname,
                source,
                lineno,
                time_delta,
            }
            | YieldFromResume {
                name,
                libname,
                source,
                lineno,
                time_delta,
            } => format!(
                "{}|{}|{}|{lineno}|{}",
                self.oid(name),
                self.oid(libname),
                self.oid(source),
                fmt_float(*time_delta)
            ),
            Assign {
                source,
                lineno,
                target,
                type_name,
                value,
                time_delta,
            } => format!(
                "{}|{lineno}|{}|{}|{}|{}",
                self.oid(source),
                self.oid(target),
                self.oid(type_name),
                self.oid(value),
                fmt_float(*time_delta)
            ),
            Argument {
                name,
                type_name,
                value,
            } => format!(
                "{}|{}|{}",
                self.oid(name),
                self.oid(type_name),
                self.oid(value)
            ),
            Tag { tag } => self.oid(tag),
            SetStartTime { start_time_delta } => fmt_float(*start_time_delta),
            TracebackStart {
                message,
                time_delta,
            } => format!("{}|{}", self.oid(message), fmt_float(*time_delta)),
            TracebackEntry {
                source,
                lineno,
                method,
                line_content,
            } => format!(
                "{}|{lineno}|{}|{}",
                self.oid(source),
                self.oid(method),
                self.oid(line_content)
            ),
            TracebackVariable {
                name,
                type_name,
                value,
            } => format!(
                "{}|{}|{}",
                self.oid(name),
                self.oid(type_name),
                self.oid(value)
            ),
            TracebackEnd { time_delta } => fmt_float(*time_delta),
            LogMessage {
                level,
                message,
                source,
                lineno,
                time_delta,
                ..
            } => format!(
                "{}|{}|{}|{lineno}|{}",
                level.as_letter(),
                self.oid(message),
                self.oid(source),
                fmt_float(*time_delta)
            ),
        }
    }
}

/// Time deltas are not allowed to poison a line: non-finite values
/// encode as zero. Finite values use shortest round-trip formatting,
/// so decoding reproduces the exact f64 that was encoded.
fn fmt_float(value: f64) -> String {
    if value.is_finite() {
        format!("{value}")
    } else {
        "0".to_string()
    }
}
