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

//! Core error types

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, RuntraceError>;

/// Errors that can occur while instrumenting or executing traced code
#[derive(Debug, Error)]
pub enum RuntraceError {
    /// A source unit could not be instrumented. Fatal to loading that
    /// unit; it is never silently skipped.
    #[error("Instrumentation failed for {unit}: {reason}")]
    Instrumentation { unit: String, reason: String },

    /// A call site referenced a callable that is not loaded.
    #[error("Callable not found: {0}")]
    CallableNotFound(String),

    /// An error raised by traced code, propagated out of the executor
    /// after the traceback events were dispatched.
    #[error("Traced code failed: {0}")]
    TracedFailure(String),

    /// A generator was resumed after it completed or failed.
    #[error("Generator {0} is not resumable")]
    GeneratorExhausted(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
