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

//! Decoded-message assertions for tests
//!
//! Subset matching: an expectation names a message type and any fields
//! it cares about; a decoded message matches when the type is equal and
//! every named field is equal. Field order and unnamed fields are
//! ignored.

use crate::decode::Decoded;
use serde_json::Value;

/// One expected message.
#[derive(Debug, Clone)]
pub struct Expected {
    message_type: String,
    fields: Vec<(String, Value)>,
}

impl Expected {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    fn matches(&self, decoded: &Decoded) -> bool {
        decoded.message_type == self.message_type
            && self
                .fields
                .iter()
                .all(|(name, value)| decoded.field(name) == Some(value))
    }
}

/// Check that each expectation matches at least one decoded message.
/// The error lists every unmatched expectation and the message types
/// actually seen.
pub fn verify_messages(
    messages: &[Decoded],
    expected: &[Expected],
) -> std::result::Result<(), String> {
    let unmatched: Vec<&Expected> = expected
        .iter()
        .filter(|exp| !messages.iter().any(|msg| exp.matches(msg)))
        .collect();
    if unmatched.is_empty() {
        return Ok(());
    }
    let seen: Vec<&str> = messages.iter().map(|m| m.message_type.as_str()).collect();
    Err(format!(
        "expected messages not found: {unmatched:?}\nmessage types seen: {seen:?}"
    ))
}

/// Count the messages of one type.
pub fn count_messages(messages: &[Decoded], message_type: &str) -> usize {
    messages
        .iter()
        .filter(|m| m.message_type == message_type)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_all;
    use serde_json::json;

    #[test]
    fn test_subset_matching() {
        let messages =
            decode_all("M 1:\"suite\"\nSR 1|0.000\nM 2:\"PASS\"\nER 2|1.000\n").unwrap();
        verify_messages(
            &messages,
            &[
                Expected::new("SR").field("name", json!("suite")),
                Expected::new("ER").field("status", json!("PASS")),
            ],
        )
        .unwrap();

        let err = verify_messages(
            &messages,
            &[Expected::new("ER").field("status", json!("FAIL"))],
        )
        .unwrap_err();
        assert!(err.contains("ER"));
    }

    #[test]
    fn test_count_messages() {
        let messages = decode_all("M 1:\"x\"\nTG 1\nTG 1\n").unwrap();
        assert_eq!(count_messages(&messages, "TG"), 2);
        assert_eq!(count_messages(&messages, "SR"), 0);
    }
}
