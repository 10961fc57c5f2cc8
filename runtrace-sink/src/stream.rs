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

//! Live JSON streaming of the trace
//!
//! A background thread decodes raw trace lines as they are produced and
//! writes one JSON object per message to the given writer, flushed per
//! message so an attached consumer sees events live. Shutdown drains
//! the queue before joining: no decoded message is lost.

use runtrace_wire::{Decoded, Decoder};
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use tracing::warn;

/// Environment switch enabling stdout streaming in the launcher.
pub const STREAM_ENV_VAR: &str = "RT_LOG_OUTPUT_STDOUT";

/// Whether the environment asks for stdout streaming (`1`, `t` or
/// `true`).
pub fn stream_enabled() -> bool {
    match std::env::var(STREAM_ENV_VAR) {
        Ok(value) => matches!(value.trim().to_lowercase().as_str(), "1" | "t" | "true"),
        Err(_) => false,
    }
}

enum Msg {
    Line(String),
    Exit,
}

/// Background decoder writing one JSON object per decoded message.
pub struct JsonStreamer {
    tx: Sender<Msg>,
    worker: Option<JoinHandle<()>>,
}

impl JsonStreamer {
    pub fn spawn(mut writer: impl Write + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel::<Msg>();
        let worker = std::thread::Builder::new()
            .name("runtrace-json-stream".into())
            .spawn(move || {
                let mut decoder = Decoder::new();
                while let Ok(msg) = rx.recv() {
                    match msg {
                        Msg::Exit => break,
                        Msg::Line(line) => match decoder.decode_line(&line) {
                            Ok(Some(decoded)) => {
                                let json = to_json(&decoded);
                                if writeln!(writer, "{json}").and_then(|_| writer.flush()).is_err()
                                {
                                    // Consumer went away; keep draining
                                    // so producers never block.
                                    continue;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "undecodable trace line in stream"),
                        },
                    }
                }
            })
            .ok();
        if worker.is_none() {
            warn!("failed to spawn json stream thread; streaming disabled");
        }
        Self { tx, worker }
    }

    pub fn push_line(&self, line: &str) {
        let _ = self.tx.send(Msg::Line(line.to_string()));
    }

    /// Drain pending lines and stop the worker.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(Msg::Exit);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for JsonStreamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Flatten a decoded message for consumers: the tag, every field, and
/// the per-line error when present.
fn to_json(decoded: &Decoded) -> Value {
    let mut map = Map::new();
    map.insert(
        "message_type".into(),
        Value::String(decoded.message_type.clone()),
    );
    for (name, value) in &decoded.fields {
        map.insert(name.clone(), value.clone());
    }
    if let Some(error) = &decoded.error {
        map.insert("error".into(), Value::String(error.clone()));
    }
    Value::Object(map)
}
