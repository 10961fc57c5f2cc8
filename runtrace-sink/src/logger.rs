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

//! Trace logger: events in, encoded lines out
//!
//! Owns one [`Encoder`] and one output backend. On rotation the memo
//! watermark resets and the segment header is re-written, so every
//! segment decodes on its own.
//!
//! A sink failure must never fail the traced code: the hook adapter
//! returned by [`TraceLogger::attach`] logs write errors and drops the
//! event.

use crate::error::{Result, SinkError};
use crate::rotate::RotatingFileSink;
use parking_lot::Mutex;
use runtrace_core::{HookHandle, HookRegistry, LifecycleEvent};
use runtrace_wire::Encoder;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

enum Backend {
    Rotating(RotatingFileSink),
    Callback(Box<dyn FnMut(&str) + Send>),
}

struct LoggerState {
    encoder: Encoder,
    backend: Backend,
    run_id: String,
}

type CloseCallback = Box<dyn FnOnce(&[PathBuf]) + Send>;

/// Encodes lifecycle events and writes them to one output.
pub struct TraceLogger {
    state: Mutex<LoggerState>,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
}

impl TraceLogger {
    /// File-backed logger rotating inside `dir`.
    pub fn to_dir(dir: impl Into<PathBuf>, max_bytes: u64, max_files: usize) -> Result<Arc<Self>> {
        let mut sink = RotatingFileSink::new(dir, max_bytes, max_files)?;
        let encoder = Encoder::new();
        let run_id = new_run_id();
        for line in encoder.header(sink.part(), &run_id) {
            sink.write_line(&line)?;
        }
        Ok(Arc::new(Self {
            state: Mutex::new(LoggerState {
                encoder,
                backend: Backend::Rotating(sink),
                run_id,
            }),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        }))
    }

    /// Logger handing every encoded line to `write`. No rotation.
    pub fn in_memory(mut write: impl FnMut(&str) + Send + 'static) -> Arc<Self> {
        let encoder = Encoder::new();
        let run_id = new_run_id();
        for line in encoder.header(1, &run_id) {
            write(&line);
        }
        Arc::new(Self {
            state: Mutex::new(LoggerState {
                encoder,
                backend: Backend::Callback(Box::new(write)),
                run_id,
            }),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        })
    }

    /// Encode and write one event. Events after [`TraceLogger::close`]
    /// are silently dropped: hooks may still fire while outputs are
    /// being torn down.
    pub fn emit(&self, event: &LifecycleEvent) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut lines = state.encoder.encode(event)?;
        match &mut state.backend {
            Backend::Rotating(sink) => {
                let incoming: usize = lines.iter().map(|l| l.len() + 1).sum();
                if sink.needs_rotation(incoming) {
                    sink.rotate()?;
                    // Fresh segment: full header and memo table again.
                    state.encoder.reset_segment();
                    let mut fresh = state.encoder.header(sink.part(), &state.run_id);
                    fresh.extend(state.encoder.encode(event)?);
                    lines = fresh;
                }
                for line in &lines {
                    sink.write_line(line)?;
                }
            }
            Backend::Callback(write) => {
                for line in &lines {
                    write(line);
                }
            }
        }
        Ok(())
    }

    /// Subscribe this logger to every lifecycle event. Keep the handles
    /// alive for as long as the logger should receive events.
    pub fn attach(self: &Arc<Self>, registry: &Arc<HookRegistry>) -> Vec<HookHandle> {
        let logger = Arc::clone(self);
        registry.subscribe_all(move |event| {
            if let Err(e) = logger.emit(event) {
                error!(tag = event.tag(), error = %e, "trace sink write failed; event dropped");
            }
        })
    }

    /// Run `callback` with the live segment paths once this logger
    /// closes. This is where a report packager plugs in.
    pub fn set_close_callback(&self, callback: impl FnOnce(&[PathBuf]) + Send + 'static) {
        *self.on_close.lock() = Some(Box::new(callback));
    }

    /// Flush and stop accepting events. Returns the live segment paths
    /// for file-backed loggers. Idempotent.
    pub fn close(&self) -> Result<Vec<PathBuf>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock();
        let paths = match &mut state.backend {
            Backend::Rotating(sink) => {
                sink.flush()?;
                sink.segments()
            }
            Backend::Callback(_) => Vec::new(),
        };
        drop(state);
        if let Some(callback) = self.on_close.lock().take() {
            callback(&paths);
        }
        Ok(paths)
    }
}

fn new_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}-{:x}", std::process::id(), nanos)
}

/// Tracks active loggers so outputs can be torn down together.
#[derive(Default)]
pub struct SinkRegistry {
    active: Mutex<Vec<(Arc<TraceLogger>, Vec<HookHandle>)>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, logger: Arc<TraceLogger>, handles: Vec<HookHandle>) {
        self.active.lock().push((logger, handles));
    }

    /// Close every registered logger, detaching its hooks. Returns all
    /// live segment paths.
    pub fn close_all(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for (logger, handles) in self.active.lock().drain(..) {
            drop(handles);
            paths.extend(logger.close()?);
        }
        Ok(paths)
    }
}
