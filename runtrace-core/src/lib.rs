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

//! Runtrace core
//!
//! Automatic execution tracing: classification of source units into
//! instrumentation policies, hook-point planning over a language-neutral
//! unit representation, the executor that drives instrumented callables,
//! and the lifecycle hook registry that fans events out to sinks.
//!
//! Wire encoding and output sinks live in their own crates
//! (`runtrace-wire`, `runtrace-sink`); this crate is where events are
//! produced, not where they are written.

pub mod error;
pub mod event;
pub mod exec;
pub mod filter;
pub mod instrument;
pub mod registry;
pub mod unit;

pub use error::{Result, RuntraceError};
pub use event::{EntryKind, LifecycleEvent, LogLevel, Status};
pub use exec::{GenState, RunClock, Runtime, SuppressGuard, TraceGenerator};
pub use filter::{Filter, FilterKind, InstrumentationPolicy, TraceConfig};
pub use instrument::{instrument, CallablePlan, RewrittenUnit};
pub use registry::{EventKind, HookHandle, HookRegistry};
pub use unit::{Callable, Expr, SourceUnit, Stmt, Value};
