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

//! Lifecycle events
//!
//! The discriminated records dispatched through the hook registry and
//! serialized by the wire encoder. Events are transient: constructed,
//! dispatched and discarded. All time fields are deltas in seconds from
//! the owning run's start, never wall clocks, so encodings stay
//! diff-stable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a run, task or element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Initial status for a task which was not run.
    NotRun,
    Pass,
    Error,
    Fail,
    Info,
    Warn,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NotRun => "NOT_RUN",
            Status::Pass => "PASS",
            Status::Error => "ERROR",
            Status::Fail => "FAIL",
            Status::Info => "INFO",
            Status::Warn => "WARN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a traced element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An ordinary callable.
    Method,
    /// A fully traced suspendable callable (per-yield events emitted).
    Generator,
    /// A boundary-only suspendable callable: only the whole generator
    /// lifetime is bracketed, no per-yield events.
    UntrackedGenerator,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Method => "METHOD",
            EntryKind::Generator => "GENERATOR",
            EntryKind::UntrackedGenerator => "UNTRACKED_GENERATOR",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an explicit log message. Encoded as a single letter on
/// the wire (`E`, `W`, `I`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_letter(&self) -> &'static str {
        match self {
            LogLevel::Info => "I",
            LogLevel::Warn => "W",
            LogLevel::Error => "E",
        }
    }
}

/// A single trace event.
///
/// The variants map one-to-one onto the wire tags (see `runtrace-wire`):
/// `SR`/`ER` run boundaries, `ST`/`ET` task boundaries, `SE`/`EE`
/// element (call/scope) boundaries, `YS`/`YR` and `YFS`/`YFR` generator
/// suspend/resume, `AS` assignments, `EA` arguments, `TG` tags, `S`
/// start-time overrides, `STB`/`TBE`/`TBV`/`ETB` tracebacks and
/// `L`/`LH` log messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    RunStart {
        name: String,
        time_delta: f64,
    },
    RunEnd {
        status: Status,
        time_delta: f64,
    },
    TaskStart {
        name: String,
        libname: String,
        source: String,
        lineno: i64,
        time_delta: f64,
    },
    TaskEnd {
        status: Status,
        message: String,
        time_delta: f64,
    },
    ElementStart {
        name: String,
        libname: String,
        kind: EntryKind,
        doc: String,
        source: String,
        lineno: i64,
        time_delta: f64,
    },
    ElementEnd {
        kind: EntryKind,
        status: Status,
        time_delta: f64,
    },
    YieldSuspend {
        name: String,
        libname: String,
        source: String,
        lineno: i64,
        type_name: String,
        value: String,
        time_delta: f64,
    },
    YieldResume {
        name: String,
        libname: String,
        source: String,
        lineno: i64,
        time_delta: f64,
    },
    YieldFromSuspend {
        name: String,
        libname: String,
        source: String,
        lineno: i64,
        time_delta: f64,
    },
    YieldFromResume {
        name: String,
        libname: String,
        source: String,
        lineno: i64,
        time_delta: f64,
    },
    Assign {
        source: String,
        lineno: i64,
        target: String,
        type_name: String,
        value: String,
        time_delta: f64,
    },
    Argument {
        name: String,
        type_name: String,
        value: String,
    },
    Tag {
        tag: String,
    },
    SetStartTime {
        start_time_delta: f64,
    },
    TracebackStart {
        message: String,
        time_delta: f64,
    },
    TracebackEntry {
        source: String,
        lineno: i64,
        method: String,
        line_content: String,
    },
    TracebackVariable {
        name: String,
        type_name: String,
        value: String,
    },
    TracebackEnd {
        time_delta: f64,
    },
    LogMessage {
        level: LogLevel,
        message: String,
        html: bool,
        source: String,
        lineno: i64,
        time_delta: f64,
    },
}

impl LifecycleEvent {
    /// Wire tag for this event.
    pub fn tag(&self) -> &'static str {
        match self {
            LifecycleEvent::RunStart { .. } => "SR",
            LifecycleEvent::RunEnd { .. } => "ER",
            LifecycleEvent::TaskStart { .. } => "ST",
            LifecycleEvent::TaskEnd { .. } => "ET",
            LifecycleEvent::ElementStart { .. } => "SE",
            LifecycleEvent::ElementEnd { .. } => "EE",
            LifecycleEvent::YieldSuspend { .. } => "YS",
            LifecycleEvent::YieldResume { .. } => "YR",
            LifecycleEvent::YieldFromSuspend { .. } => "YFS",
            LifecycleEvent::YieldFromResume { .. } => "YFR",
            LifecycleEvent::Assign { .. } => "AS",
            LifecycleEvent::Argument { .. } => "EA",
            LifecycleEvent::Tag { .. } => "TG",
            LifecycleEvent::SetStartTime { .. } => "S",
            LifecycleEvent::TracebackStart { .. } => "STB",
            LifecycleEvent::TracebackEntry { .. } => "TBE",
            LifecycleEvent::TracebackVariable { .. } => "TBV",
            LifecycleEvent::TracebackEnd { .. } => "ETB",
            LifecycleEvent::LogMessage { html, .. } => {
                if *html {
                    "LH"
                } else {
                    "L"
                }
            }
        }
    }
}
