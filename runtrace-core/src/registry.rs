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

//! Lifecycle hook registry
//!
//! One ordered subscriber list per event kind. Instrumented code is the
//! sole dispatcher for method/assign/yield kinds; run and task boundary
//! kinds are dispatched explicitly by the task-execution collaborator.
//!
//! The registry is an explicit, injected object with a documented
//! register/unregister lifecycle rather than an implicit process-wide
//! map, which keeps concurrency reasoning local. Dispatch order is
//! registration order. A callback that panics is caught and logged; it
//! never prevents the remaining callbacks from running and never
//! replaces the exception path of the instrumented call site.

use crate::event::LifecycleEvent;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

/// The named callback lists a subscriber can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StartRun,
    EndRun,
    StartTask,
    EndTask,
    BeforeMethod,
    AfterMethod,
    MethodExcept,
    AfterAssign,
    BeforeYield,
    AfterYield,
    BeforeYieldFrom,
    AfterYieldFrom,
    LogMessage,
}

impl EventKind {
    /// All kinds, in a stable order. Used by sinks which subscribe to
    /// the whole stream.
    pub const ALL: [EventKind; 13] = [
        EventKind::StartRun,
        EventKind::EndRun,
        EventKind::StartTask,
        EventKind::EndTask,
        EventKind::BeforeMethod,
        EventKind::AfterMethod,
        EventKind::MethodExcept,
        EventKind::AfterAssign,
        EventKind::BeforeYield,
        EventKind::AfterYield,
        EventKind::BeforeYieldFrom,
        EventKind::AfterYieldFrom,
        EventKind::LogMessage,
    ];

    /// The list an event is dispatched on.
    pub fn for_event(event: &LifecycleEvent) -> EventKind {
        match event {
            LifecycleEvent::RunStart { .. } => EventKind::StartRun,
            LifecycleEvent::RunEnd { .. } => EventKind::EndRun,
            LifecycleEvent::TaskStart { .. } => EventKind::StartTask,
            LifecycleEvent::TaskEnd { .. } => EventKind::EndTask,
            LifecycleEvent::ElementStart { .. }
            | LifecycleEvent::Argument { .. }
            | LifecycleEvent::Tag { .. }
            | LifecycleEvent::SetStartTime { .. } => EventKind::BeforeMethod,
            LifecycleEvent::ElementEnd { .. } => EventKind::AfterMethod,
            LifecycleEvent::TracebackStart { .. }
            | LifecycleEvent::TracebackEntry { .. }
            | LifecycleEvent::TracebackVariable { .. }
            | LifecycleEvent::TracebackEnd { .. } => EventKind::MethodExcept,
            LifecycleEvent::Assign { .. } => EventKind::AfterAssign,
            LifecycleEvent::YieldSuspend { .. } => EventKind::BeforeYield,
            LifecycleEvent::YieldResume { .. } => EventKind::AfterYield,
            LifecycleEvent::YieldFromSuspend { .. } => EventKind::BeforeYieldFrom,
            LifecycleEvent::YieldFromResume { .. } => EventKind::AfterYieldFrom,
            LifecycleEvent::LogMessage { .. } => EventKind::LogMessage,
        }
    }
}

type Callback = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Default)]
struct Lists {
    // One (id, callback) list per kind; ids keep removal exact under
    // concurrent registration.
    entries: Vec<(EventKind, u64, Callback)>,
}

/// Process-wide set of named, orderable callback lists.
pub struct HookRegistry {
    lists: RwLock<Lists>,
    next_id: AtomicU64,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            lists: RwLock::new(Lists::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `callback` to one event kind. The returned handle is a
    /// capability: releasing it removes exactly that callback.
    pub fn register(
        self: &Arc<Self>,
        kind: EventKind,
        callback: impl Fn(&LifecycleEvent) + Send + Sync + 'static,
    ) -> HookHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback = Arc::new(callback);
        self.lists.write().entries.push((kind, id, callback));
        HookHandle {
            registry: Arc::downgrade(self),
            kind,
            id,
        }
    }

    /// Subscribe one callback to every event kind. Sinks use this to
    /// receive the whole stream.
    pub fn subscribe_all(
        self: &Arc<Self>,
        callback: impl Fn(&LifecycleEvent) + Send + Sync + 'static,
    ) -> Vec<HookHandle> {
        let callback: Callback = Arc::new(callback);
        EventKind::ALL
            .iter()
            .map(|kind| {
                let cb = Arc::clone(&callback);
                self.register(*kind, move |e| cb(e))
            })
            .collect()
    }

    /// Dispatch an event to the subscribers of its kind, in
    /// registration order. Callback panics are captured per-callback
    /// and logged, never interrupting either the remaining callbacks or
    /// the instrumented call's own control flow.
    pub fn dispatch(&self, event: &LifecycleEvent) {
        let kind = EventKind::for_event(event);
        let callbacks: Vec<Callback> = {
            let lists = self.lists.read();
            lists
                .entries
                .iter()
                .filter(|(k, _, _)| *k == kind)
                .map(|(_, _, cb)| Arc::clone(cb))
                .collect()
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(tag = event.tag(), "lifecycle hook panicked; continuing");
            }
        }
    }

    fn unregister(&self, kind: EventKind, id: u64) {
        self.lists
            .write()
            .entries
            .retain(|(k, i, _)| !(*k == kind && *i == id));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lists.read().entries.len()
    }
}

/// Capability returned by [`HookRegistry::register`]; releasing (or
/// dropping) it deterministically removes the registered callback.
pub struct HookHandle {
    registry: Weak<HookRegistry>,
    kind: EventKind,
    id: u64,
}

impl HookHandle {
    /// Remove the callback now.
    pub fn release(self) {
        // Removal happens in Drop.
    }
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.kind, self.id);
        }
    }
}
