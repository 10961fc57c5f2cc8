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

//! Runtrace sinks
//!
//! Where encoded trace lines go: size-rotated files in an output
//! directory, an in-memory callback, or a live JSON stream decoded in a
//! background thread. All I/O is synchronous; concurrency is plain
//! threads and channels.

pub mod error;
pub mod logger;
pub mod rotate;
pub mod stream;

pub use error::{Result, SinkError};
pub use logger::{SinkRegistry, TraceLogger};
pub use rotate::{parse_size, RotatingFileSink};
pub use stream::{stream_enabled, JsonStreamer, STREAM_ENV_VAR};
