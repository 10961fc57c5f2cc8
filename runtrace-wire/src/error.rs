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

//! Wire-format error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    /// A line had no `TAG payload` shape at all.
    #[error("malformed line: {0:?}")]
    MalformedLine(String),

    /// A tag outside the message-type table.
    #[error("unknown message type: {0}")]
    UnknownTag(String),

    /// Report artifact without the embedded chunk marker (and no
    /// sibling bundle to fall back to).
    #[error("embedded trace marker not found in {0}")]
    MarkerNotFound(String),

    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("embedded chunk is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
