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

//! Trace-format decoder
//!
//! Table-driven: each tag maps to an ordered field spec. Oid fields
//! resolve against the memo built up from `M` lines earlier in the
//! stream. A field that fails to coerce decodes as null and the rest of
//! the line still decodes; a whole-line failure surfaces in
//! [`Decoded::error`] instead of aborting the stream.

use crate::error::{Result, WireError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::BufRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Oid,
    Int,
    Float,
    Str,
}

type FieldSpec = &'static [(&'static str, FieldType)];

const TIME_DELTA: (&str, FieldType) = ("time_delta_in_seconds", FieldType::Float);

const SPEC_RUN_START: FieldSpec = &[("name", FieldType::Oid), TIME_DELTA];
const SPEC_RUN_END: FieldSpec = &[("status", FieldType::Oid), TIME_DELTA];
const SPEC_TASK_START: FieldSpec = &[
    ("name", FieldType::Oid),
    ("libname", FieldType::Oid),
    ("source", FieldType::Oid),
    ("lineno", FieldType::Int),
    TIME_DELTA,
];
const SPEC_TASK_END: FieldSpec = &[
    ("status", FieldType::Oid),
    ("message", FieldType::Oid),
    TIME_DELTA,
];
const SPEC_ELEMENT_START: FieldSpec = &[
    ("name", FieldType::Oid),
    ("libname", FieldType::Oid),
    ("type", FieldType::Oid),
    ("doc", FieldType::Oid),
    ("source", FieldType::Oid),
    ("lineno", FieldType::Int),
    TIME_DELTA,
];
const SPEC_ELEMENT_END: FieldSpec = &[
    ("type", FieldType::Oid),
    ("status", FieldType::Oid),
    TIME_DELTA,
];
const SPEC_YIELD_SUSPEND: FieldSpec = &[
    ("name", FieldType::Oid),
    ("libname", FieldType::Oid),
    ("source", FieldType::Oid),
    ("lineno", FieldType::Int),
    ("type", FieldType::Oid),
    ("value", FieldType::Oid),
    TIME_DELTA,
];
const SPEC_YIELD_RESUME: FieldSpec = &[
    ("name", FieldType::Oid),
    ("libname", FieldType::Oid),
    ("source", FieldType::Oid),
    ("lineno", FieldType::Int),
    TIME_DELTA,
];
const SPEC_ASSIGN: FieldSpec = &[
    ("source", FieldType::Oid),
    ("lineno", FieldType::Int),
    ("target", FieldType::Oid),
    ("type", FieldType::Oid),
    ("value", FieldType::Oid),
    TIME_DELTA,
];
const SPEC_ARGUMENT: FieldSpec = &[
    ("name", FieldType::Oid),
    ("type", FieldType::Oid),
    ("value", FieldType::Oid),
];
const SPEC_TAG: FieldSpec = &[("tag", FieldType::Oid)];
const SPEC_START_TIME: FieldSpec = &[("start_time_delta", FieldType::Float)];
const SPEC_LOG: FieldSpec = &[
    ("level", FieldType::Str),
    ("message", FieldType::Oid),
    ("source", FieldType::Oid),
    ("lineno", FieldType::Int),
    TIME_DELTA,
];
const SPEC_TB_START: FieldSpec = &[("message", FieldType::Oid), TIME_DELTA];
const SPEC_TB_ENTRY: FieldSpec = &[
    ("source", FieldType::Oid),
    ("lineno", FieldType::Int),
    ("method", FieldType::Oid),
    ("line_content", FieldType::Oid),
];
const SPEC_TB_VARIABLE: FieldSpec = &[
    ("name", FieldType::Oid),
    ("type", FieldType::Oid),
    ("value", FieldType::Oid),
];
const SPEC_TB_END: FieldSpec = &[TIME_DELTA];
const SPEC_VERSION: FieldSpec = &[("version", FieldType::Str)];
const SPEC_ID: FieldSpec = &[("part", FieldType::Int), ("id", FieldType::Str)];

/// Field spec for `tag`, with restart aliases resolving to the spec of
/// the tag they alias.
fn spec_for(tag: &str) -> Option<FieldSpec> {
    Some(match tag {
        "V" => SPEC_VERSION,
        "ID" => SPEC_ID,
        "SR" | "RR" => SPEC_RUN_START,
        "ER" => SPEC_RUN_END,
        "ST" | "RT" => SPEC_TASK_START,
        "ET" => SPEC_TASK_END,
        "SE" | "RE" => SPEC_ELEMENT_START,
        "EE" => SPEC_ELEMENT_END,
        "YS" => SPEC_YIELD_SUSPEND,
        "YR" | "RYR" | "YFS" | "YFR" => SPEC_YIELD_RESUME,
        "AS" => SPEC_ASSIGN,
        "EA" => SPEC_ARGUMENT,
        "TG" => SPEC_TAG,
        "S" => SPEC_START_TIME,
        "L" | "LH" => SPEC_LOG,
        "STB" | "RTB" => SPEC_TB_START,
        "TBE" => SPEC_TB_ENTRY,
        "TBV" => SPEC_TB_VARIABLE,
        "ETB" => SPEC_TB_END,
        _ => return None,
    })
}

/// One decoded message: the tag, its named fields, and the decode error
/// for this line if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub message_type: String,
    pub fields: Map<String, Value>,
    pub error: Option<String>,
}

impl Decoded {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Streaming decoder holding the memo for one segment.
#[derive(Debug, Default)]
pub struct Decoder {
    memo: HashMap<String, String>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line. `Ok(None)` means the line carried no message of
    /// its own (blank, or an `M` memo entry).
    pub fn decode_line(&mut self, line: &str) -> Result<Option<Decoded>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (tag, payload) = line
            .split_once(' ')
            .ok_or_else(|| WireError::MalformedLine(line.to_string()))?;
        match tag {
            "M" => {
                self.insert_memo(payload)?;
                Ok(None)
            }
            "I" => {
                let mut fields = Map::new();
                let mut error = None;
                match serde_json::from_str::<Value>(payload) {
                    Ok(info) => {
                        fields.insert("info".into(), info);
                    }
                    Err(e) => error = Some(format!("Error decoding: I: {e}")),
                }
                Ok(Some(Decoded {
                    message_type: "I".into(),
                    fields,
                    error,
                }))
            }
            "T" => Ok(Some(self.decode_time(payload))),
            _ => {
                let spec =
                    spec_for(tag).ok_or_else(|| WireError::UnknownTag(tag.to_string()))?;
                Ok(Some(self.decode_fields(tag, payload, spec)))
            }
        }
    }

    fn insert_memo(&mut self, payload: &str) -> Result<()> {
        let (id, raw) = payload
            .split_once(':')
            .ok_or_else(|| WireError::MalformedLine(format!("M {payload}")))?;
        let value: String = serde_json::from_str(raw)?;
        self.memo.insert(id.to_string(), value);
        Ok(())
    }

    fn decode_time(&self, payload: &str) -> Decoded {
        let mut fields = Map::new();
        let error = match chrono::DateTime::parse_from_rfc3339(payload) {
            Ok(_) => {
                fields.insert("initial_time".into(), Value::String(payload.to_string()));
                None
            }
            Err(e) => Some(format!("Error decoding: T: {e}")),
        };
        Decoded {
            message_type: "T".into(),
            fields,
            error,
        }
    }

    fn decode_fields(&self, tag: &str, payload: &str, spec: FieldSpec) -> Decoded {
        let mut fields = Map::new();
        // The last field may contain the separator; cap the split.
        let parts = payload.splitn(spec.len(), '|');
        for ((name, field_type), part) in spec.iter().zip(parts) {
            let value = match field_type {
                FieldType::Oid => self.memo.get(part).cloned().map(Value::String),
                FieldType::Int => part.parse::<i64>().ok().map(Value::from),
                FieldType::Float => part.parse::<f64>().ok().map(Value::from),
                FieldType::Str => Some(Value::String(part.to_string())),
            };
            // Per-field coercion failure decodes as null.
            fields.insert((*name).to_string(), value.unwrap_or(Value::Null));
        }
        Decoded {
            message_type: tag.to_string(),
            fields,
            error: None,
        }
    }
}

/// Decode every message from a line stream, skipping memo/blank lines.
pub fn iter_decoded<R: BufRead>(reader: R) -> impl Iterator<Item = Result<Decoded>> {
    let mut decoder = Decoder::new();
    reader.lines().filter_map(move |line| match line {
        Ok(line) => decoder.decode_line(&line).transpose(),
        Err(e) => Some(Err(WireError::Io(e))),
    })
}

/// Decode a whole in-memory log, failing on the first malformed line.
pub fn decode_all(text: &str) -> Result<Vec<Decoded>> {
    let mut decoder = Decoder::new();
    let mut out = Vec::new();
    for line in text.lines() {
        if let Some(decoded) = decoder.decode_line(line)? {
            out.push(decoded);
        }
    }
    Ok(out)
}
