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

//! Runtrace wire format
//!
//! The line-oriented trace encoding: encoder with string memoization,
//! table-driven decoder, and extraction of traces embedded in report
//! artifacts. Producing events is `runtrace-core`'s job; writing the
//! encoded lines anywhere is `runtrace-sink`'s.

pub mod decode;
pub mod embed;
pub mod encode;
pub mod error;
pub mod verify;

pub use decode::{decode_all, iter_decoded, Decoded, Decoder};
pub use embed::{
    embed_chunks, extract_from_artifact, extract_from_text, iter_decoded_from_artifact,
    CHUNK_MARKER, DEFAULT_CHUNK_SIZE,
};
pub use encode::{Encoder, MemoTable, DOC_VERSION};
pub use error::{Result, WireError};
pub use verify::{count_messages, verify_messages, Expected};
