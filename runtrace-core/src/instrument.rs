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

//! Instrumenter
//!
//! `instrument(unit, policy)` produces a deterministic, pure plan of
//! hook points over the unit's IR: same input, identical output. The
//! plan is consumed once, before execution, by the executor. Planning
//! never runs traced code, so instrumentation cannot recursively
//! trigger itself.

use crate::error::{Result, RuntraceError};
use crate::event::EntryKind;
use crate::filter::{InstrumentationPolicy, TraceConfig};
use crate::unit::SourceUnit;

/// The hook plan for one callable.
#[derive(Debug, Clone, PartialEq)]
pub struct CallablePlan {
    /// Index into the unit's callable list.
    pub index: usize,
    /// Declared type recorded in `ElementStart`/`ElementEnd`.
    pub kind: EntryKind,
    /// Emit the before/after/except triple around activations.
    pub bracket: bool,
    /// Bracket only the outermost activation entered from traced code.
    pub boundary_only: bool,
    /// Emit an `Assign` event after each binding statement.
    pub trace_assigns: bool,
    /// Emit per-suspend-point events (Full generators only).
    pub trace_yields: bool,
    /// Emit `Argument` events for declared parameters on entry.
    pub trace_arguments: bool,
}

/// A source unit plus its instrumentation plan. Equivalent to the
/// input unit; hook invocation points are explicit.
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenUnit {
    pub unit: SourceUnit,
    pub policy: InstrumentationPolicy,
    pub plans: Vec<CallablePlan>,
}

impl RewrittenUnit {
    pub fn plan_for(&self, index: usize) -> Option<&CallablePlan> {
        self.plans.iter().find(|p| p.index == index)
    }
}

/// Plan hook points for every callable in `unit` under `policy`.
///
/// Suspendable callables cannot use a single before/after pair around
/// each activation step; they are classified as GENERATOR (Full: one
/// bracketing triple for the whole lifetime plus per-yield events) or
/// UNTRACKED_GENERATOR (BoundaryOnly: one bracketing triple, no
/// per-yield events).
pub fn instrument(
    unit: &SourceUnit,
    policy: InstrumentationPolicy,
    config: &TraceConfig,
) -> Result<RewrittenUnit> {
    if unit.name.is_empty() {
        return Err(RuntraceError::Instrumentation {
            unit: unit.source(),
            reason: "unit has no name".into(),
        });
    }

    let mut plans = Vec::new();
    for (index, callable) in unit.callables.iter().enumerate() {
        // Docstring-only or empty bodies stay unrewritten.
        if callable.is_trivial() {
            continue;
        }
        let generator = callable.is_generator();
        let plan = match policy {
            InstrumentationPolicy::None => continue,
            InstrumentationPolicy::Full => CallablePlan {
                index,
                kind: if generator {
                    EntryKind::Generator
                } else {
                    EntryKind::Method
                },
                bracket: true,
                boundary_only: false,
                trace_assigns: config.trace_assigns(),
                trace_yields: generator,
                trace_arguments: true,
            },
            InstrumentationPolicy::BoundaryOnly => CallablePlan {
                index,
                kind: if generator {
                    EntryKind::UntrackedGenerator
                } else {
                    EntryKind::Method
                },
                bracket: true,
                boundary_only: true,
                trace_assigns: false,
                trace_yields: false,
                trace_arguments: false,
            },
        };
        plans.push(plan);
    }

    Ok(RewrittenUnit {
        unit: unit.clone(),
        policy,
        plans,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Callable, Expr, Stmt, Value};

    fn unit_with(callable: Callable) -> SourceUnit {
        SourceUnit::new("/tmp/check.unit", "check").with_callable(callable)
    }

    fn assign(lineno: i64) -> Stmt {
        Stmt::Assign {
            lineno,
            target: "a".into(),
            value: Expr::Literal(Value::Int(1)),
        }
    }

    #[test]
    fn test_docstring_only_left_unrewritten() {
        let unit = unit_with(Callable::new("method", 1).with_doc("just docstring"));
        let rewritten =
            instrument(&unit, InstrumentationPolicy::Full, &TraceConfig::full_log()).unwrap();
        assert!(rewritten.plans.is_empty());
    }

    #[test]
    fn test_full_plans_method() {
        let unit = unit_with(Callable::new("method", 1).with_body(vec![assign(2)]));
        let rewritten =
            instrument(&unit, InstrumentationPolicy::Full, &TraceConfig::full_log()).unwrap();
        let plan = rewritten.plan_for(0).unwrap();
        assert_eq!(plan.kind, EntryKind::Method);
        assert!(plan.bracket);
        assert!(plan.trace_assigns);
        assert!(!plan.boundary_only);
    }

    #[test]
    fn test_assign_toggle_off() {
        let unit = unit_with(Callable::new("method", 1).with_body(vec![assign(2)]));
        let config = TraceConfig::full_log().with_trace_assigns(false);
        let rewritten = instrument(&unit, InstrumentationPolicy::Full, &config).unwrap();
        assert!(!rewritten.plan_for(0).unwrap().trace_assigns);
    }

    #[test]
    fn test_generator_kinds_per_policy() {
        let gen = Callable::new("gen", 1).with_body(vec![Stmt::Yield {
            lineno: 2,
            value: Expr::Literal(Value::Int(2)),
        }]);

        let full = instrument(
            &unit_with(gen.clone()),
            InstrumentationPolicy::Full,
            &TraceConfig::full_log(),
        )
        .unwrap();
        assert_eq!(full.plan_for(0).unwrap().kind, EntryKind::Generator);
        assert!(full.plan_for(0).unwrap().trace_yields);

        let boundary = instrument(
            &unit_with(gen),
            InstrumentationPolicy::BoundaryOnly,
            &TraceConfig::full_log(),
        )
        .unwrap();
        let plan = boundary.plan_for(0).unwrap();
        assert_eq!(plan.kind, EntryKind::UntrackedGenerator);
        assert!(!plan.trace_yields);
        assert!(plan.boundary_only);
    }

    #[test]
    fn test_none_policy_plans_nothing() {
        let unit = unit_with(Callable::new("method", 1).with_body(vec![assign(2)]));
        let rewritten =
            instrument(&unit, InstrumentationPolicy::None, &TraceConfig::full_log()).unwrap();
        assert!(rewritten.plans.is_empty());
    }

    #[test]
    fn test_instrumentation_is_deterministic() {
        let unit = unit_with(Callable::new("method", 1).with_body(vec![assign(2), assign(3)]));
        let a = instrument(&unit, InstrumentationPolicy::Full, &TraceConfig::full_log()).unwrap();
        let b = instrument(&unit, InstrumentationPolicy::Full, &TraceConfig::full_log()).unwrap();
        assert_eq!(a, b);
    }
}
