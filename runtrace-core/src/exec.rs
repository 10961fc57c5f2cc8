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

//! Executor for instrumented units
//!
//! Drives [`RewrittenUnit`] activations against the hook registry. Hook
//! dispatch is in-line: the instrumented call blocks on hook execution
//! before proceeding, so ordering between a call's own work and its
//! before/after events is exact.
//!
//! Suspendable callables run as an explicit state machine
//! (Created/Running/Suspended/Done/Failed) with YieldSuspend/YieldResume
//! as the Suspended-Running transitions.
//!
//! Two failure classes are kept strictly apart: tracing infrastructure
//! failures (hook panics) are log-only and handled by the registry;
//! traced-code failures propagate out of the executor after the
//! traceback events fire exactly once.

use crate::error::{Result, RuntraceError};
use crate::event::{EntryKind, LifecycleEvent, LogLevel, Status};
use crate::filter::TraceConfig;
use crate::instrument::{instrument, CallablePlan, RewrittenUnit};
use crate::registry::HookRegistry;
use crate::unit::{Callable, Expr, SourceUnit, Stmt, Value};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

const REDACTED: &str = "<redacted>";

/// Monotonic time-delta source for one run.
pub struct RunClock {
    start: Instant,
}

impl Default for RunClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RunClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Seconds since the run started.
    pub fn delta(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// State of a suspendable activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    Created,
    Running,
    Suspended,
    Done,
    Failed,
}

/// An error raised by traced code, carrying the frames it unwound
/// through. Reported as traceback events exactly once.
#[derive(Debug)]
struct TracedError {
    message: String,
    frames: Vec<TraceFrame>,
    reported: bool,
}

#[derive(Debug)]
struct TraceFrame {
    source: String,
    lineno: i64,
    method: String,
    line_content: String,
    variables: Vec<(String, &'static str, String)>,
}

impl TracedError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            frames: Vec::new(),
            reported: false,
        }
    }
}

struct Inner {
    registry: Arc<HookRegistry>,
    config: TraceConfig,
    units: RwLock<Vec<Arc<RewrittenUnit>>>,
    clock: RunClock,
    sensitive: RwLock<Vec<String>>,
    hidden: RwLock<Vec<String>>,
    suppressed: AtomicUsize,
    variables_suppressed: AtomicUsize,
}

impl Inner {
    fn emit(&self, mut event: LifecycleEvent) {
        if self.suppressed.load(Ordering::Relaxed) > 0 && is_traced_event(&event) {
            return;
        }
        if self.variables_suppressed.load(Ordering::Relaxed) > 0 && is_variable_event(&event) {
            return;
        }
        match &mut event {
            LifecycleEvent::LogMessage { message, .. }
            | LifecycleEvent::TracebackStart { message, .. } => {
                *message = self.scrub(std::mem::take(message));
            }
            _ => {}
        }
        self.registry.dispatch(&event);
    }

    fn is_sensitive(&self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        self.sensitive.read().iter().any(|s| lowered.contains(s))
    }

    /// Replace every occurrence of a hidden value in `text`.
    fn scrub(&self, mut text: String) -> String {
        for hidden in self.hidden.read().iter() {
            if text.contains(hidden.as_str()) {
                text = text.replace(hidden.as_str(), REDACTED);
            }
        }
        text
    }

    fn rendered(&self, name: &str, value: &Value) -> String {
        if self.is_sensitive(name) {
            REDACTED.to_string()
        } else {
            self.scrub(value.to_string())
        }
    }
}

/// Events produced by instrumented execution. Run/task boundaries,
/// explicit log messages and tags keep flowing inside a suppress scope.
fn is_traced_event(event: &LifecycleEvent) -> bool {
    !matches!(
        event,
        LifecycleEvent::RunStart { .. }
            | LifecycleEvent::RunEnd { .. }
            | LifecycleEvent::TaskStart { .. }
            | LifecycleEvent::TaskEnd { .. }
            | LifecycleEvent::LogMessage { .. }
            | LifecycleEvent::Tag { .. }
            | LifecycleEvent::SetStartTime { .. }
    )
}

fn is_variable_event(event: &LifecycleEvent) -> bool {
    matches!(
        event,
        LifecycleEvent::Argument { .. }
            | LifecycleEvent::Assign { .. }
            | LifecycleEvent::TracebackVariable { .. }
    )
}

/// Executes instrumented units and dispatches their lifecycle events.
///
/// Units are instrumented exactly once, at load, before any of their
/// callables execute; the active [`TraceConfig`] is captured at load
/// time and already-loaded units are never retro-patched.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn new(registry: Arc<HookRegistry>, config: TraceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                units: RwLock::new(Vec::new()),
                clock: RunClock::new(),
                sensitive: RwLock::new(vec!["password".into(), "passwd".into()]),
                hidden: RwLock::new(Vec::new()),
                suppressed: AtomicUsize::new(0),
                variables_suppressed: AtomicUsize::new(0),
            }),
        }
    }

    pub fn registry(&self) -> Arc<HookRegistry> {
        Arc::clone(&self.inner.registry)
    }

    /// Classify and instrument `unit`. Idempotent per path: loading the
    /// same unit twice keeps the first instrumentation. An
    /// instrumentation failure is fatal to loading that unit.
    pub fn load(&self, unit: SourceUnit) -> Result<()> {
        let mut units = self.inner.units.write();
        if units.iter().any(|u| u.unit.path == unit.path) {
            return Ok(());
        }
        let policy = self.inner.config.classify(&unit.path);
        let rewritten = instrument(&unit, policy, &self.inner.config)?;
        units.push(Arc::new(rewritten));
        Ok(())
    }

    /// Mark any variable name containing `name` as sensitive; its
    /// values are redacted in Assign/Argument/traceback events.
    pub fn add_sensitive_name(&self, name: impl Into<String>) {
        self.inner.sensitive.write().push(name.into().to_lowercase());
    }

    /// Scrub `value` wherever it appears in emitted values and
    /// messages, for secrets obtained at runtime whose variable names
    /// give nothing away.
    pub fn hide_value(&self, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.inner.hidden.write().push(value);
        }
    }

    /// Disable method and variable tracing until the guard drops.
    /// Run/task boundaries, explicit log messages and tags still flow.
    #[must_use]
    pub fn suppress(&self) -> SuppressGuard {
        self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
        SuppressGuard {
            inner: Arc::clone(&self.inner),
            variables_only: false,
        }
    }

    /// Disable Argument/Assign/TracebackVariable events until the
    /// guard drops; bracketing events still fire.
    #[must_use]
    pub fn suppress_variables(&self) -> SuppressGuard {
        self.inner.variables_suppressed.fetch_add(1, Ordering::Relaxed);
        SuppressGuard {
            inner: Arc::clone(&self.inner),
            variables_only: true,
        }
    }

    // ---- Run/task boundary events, invoked by the task-execution
    // collaborator.

    pub fn start_run(&self, name: &str) {
        self.inner.emit(LifecycleEvent::RunStart {
            name: name.into(),
            time_delta: self.inner.clock.delta(),
        });
    }

    pub fn end_run(&self, status: Status) {
        self.inner.emit(LifecycleEvent::RunEnd {
            status,
            time_delta: self.inner.clock.delta(),
        });
    }

    pub fn start_task(&self, name: &str, libname: &str, source: &str, lineno: i64) {
        self.inner.emit(LifecycleEvent::TaskStart {
            name: name.into(),
            libname: libname.into(),
            source: source.into(),
            lineno,
            time_delta: self.inner.clock.delta(),
        });
    }

    pub fn end_task(&self, status: Status, message: &str) {
        self.inner.emit(LifecycleEvent::TaskEnd {
            status,
            message: message.into(),
            time_delta: self.inner.clock.delta(),
        });
    }

    pub fn log_message(&self, level: LogLevel, message: &str, html: bool, source: &str, lineno: i64) {
        self.inner.emit(LifecycleEvent::LogMessage {
            level,
            message: message.into(),
            html,
            source: source.into(),
            lineno,
            time_delta: self.inner.clock.delta(),
        });
    }

    pub fn tag(&self, tag: &str) {
        self.inner.emit(LifecycleEvent::Tag { tag: tag.into() });
    }

    /// Run a task body: `start_task`, call the named callable, then
    /// `end_task` with PASS or ERROR. The traced failure, if any, is
    /// returned after the boundary events fire.
    pub fn run_task(&self, name: &str) -> Result<Value> {
        let (unit, index) = self
            .find(name)
            .ok_or_else(|| RuntraceError::CallableNotFound(name.into()))?;
        let callable = &unit.unit.callables[index];
        self.start_task(name, &unit.unit.name, &unit.unit.source(), callable.lineno);
        let result = self.call(name, Vec::new());
        match &result {
            Ok(_) => self.end_task(Status::Pass, ""),
            Err(err) => self.end_task(Status::Error, &err.to_string()),
        }
        result
    }

    /// Call a loaded callable. Generators are driven to exhaustion; the
    /// result is the last value produced.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let (unit, index) = self
            .find(name)
            .ok_or_else(|| RuntraceError::CallableNotFound(name.into()))?;
        match invoke(&self.inner, &unit, index, args, false, false) {
            Ok(value) => Ok(value),
            Err(mut err) => {
                // Nothing bracketed the failure (e.g. policy None all
                // the way down): still report it exactly once.
                if !err.reported {
                    report_traceback(&self.inner, &mut err);
                }
                Err(RuntraceError::TracedFailure(err.message))
            }
        }
    }

    /// Create (without driving) a suspendable activation, so the caller
    /// controls suspend/resume interleaving.
    pub fn call_generator(&self, name: &str, args: Vec<Value>) -> Result<TraceGenerator> {
        let (unit, index) = self
            .find(name)
            .ok_or_else(|| RuntraceError::CallableNotFound(name.into()))?;
        if !unit.unit.callables[index].is_generator() {
            return Err(RuntraceError::CallableNotFound(format!(
                "{name} is not a generator"
            )));
        }
        Ok(TraceGenerator::new(
            Arc::clone(&self.inner),
            unit,
            index,
            args,
            false,
            false,
        ))
    }

    fn find(&self, name: &str) -> Option<(Arc<RewrittenUnit>, usize)> {
        let units = self.inner.units.read();
        for unit in units.iter() {
            if let Some(index) = unit.unit.callables.iter().position(|c| c.name == name) {
                return Some((Arc::clone(unit), index));
            }
        }
        None
    }
}

/// Re-enables the tracing it suppressed when dropped.
pub struct SuppressGuard {
    inner: Arc<Inner>,
    variables_only: bool,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        let counter = if self.variables_only {
            &self.inner.variables_suppressed
        } else {
            &self.inner.suppressed
        };
        counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Whether this activation emits its bracketing triple, given the
/// caller context.
fn should_bracket(plan: Option<&CallablePlan>, in_library: bool) -> bool {
    match plan {
        Some(plan) => plan.bracket && (!plan.boundary_only || !in_library),
        None => false,
    }
}

/// Context inherited by calls nested inside this activation.
fn child_context(plan: Option<&CallablePlan>, in_library: bool) -> bool {
    match plan {
        Some(plan) => plan.boundary_only,
        None => in_library,
    }
}

fn emit_entry(
    inner: &Inner,
    unit: &RewrittenUnit,
    callable: &Callable,
    plan: &CallablePlan,
    locals: &BTreeMap<String, Value>,
) {
    inner.emit(LifecycleEvent::ElementStart {
        name: callable.name.clone(),
        libname: unit.unit.name.clone(),
        kind: plan.kind,
        doc: callable.doc.clone(),
        source: unit.unit.source(),
        lineno: callable.lineno,
        time_delta: inner.clock.delta(),
    });
    if plan.trace_arguments {
        for param in &callable.params {
            let value = locals.get(param).cloned().unwrap_or(Value::None);
            inner.emit(LifecycleEvent::Argument {
                name: param.clone(),
                type_name: value.type_name().into(),
                value: inner.rendered(param, &value),
            });
        }
    }
}

fn emit_exit(inner: &Inner, kind: EntryKind, status: Status) {
    inner.emit(LifecycleEvent::ElementEnd {
        kind,
        status,
        time_delta: inner.clock.delta(),
    });
}

/// Dispatch the traceback block for a failure, exactly once. Entries
/// run outermost-first, matching the order the report viewer expects.
fn report_traceback(inner: &Inner, err: &mut TracedError) {
    if err.reported {
        return;
    }
    err.reported = true;
    inner.emit(LifecycleEvent::TracebackStart {
        message: err.message.clone(),
        time_delta: inner.clock.delta(),
    });
    for frame in err.frames.iter().rev() {
        inner.emit(LifecycleEvent::TracebackEntry {
            source: frame.source.clone(),
            lineno: frame.lineno,
            method: frame.method.clone(),
            line_content: frame.line_content.clone(),
        });
        for (name, type_name, value) in &frame.variables {
            inner.emit(LifecycleEvent::TracebackVariable {
                name: name.clone(),
                type_name: (*type_name).into(),
                value: value.clone(),
            });
        }
    }
    inner.emit(LifecycleEvent::TracebackEnd {
        time_delta: inner.clock.delta(),
    });
}

fn push_frame(
    inner: &Inner,
    err: &mut TracedError,
    unit: &RewrittenUnit,
    callable: &Callable,
    lineno: i64,
    line_content: String,
    locals: &BTreeMap<String, Value>,
) {
    let variables = locals
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                value.type_name(),
                inner.rendered(name, value),
            )
        })
        .collect();
    err.frames.push(TraceFrame {
        source: unit.unit.source(),
        lineno,
        method: callable.name.clone(),
        line_content,
        variables,
    });
}

fn stmt_lineno(stmt: &Stmt) -> i64 {
    match stmt {
        Stmt::Assign { lineno, .. }
        | Stmt::Expr { lineno, .. }
        | Stmt::Raise { lineno, .. }
        | Stmt::Yield { lineno, .. }
        | Stmt::YieldFrom { lineno, .. }
        | Stmt::Return { lineno, .. }
        | Stmt::Log { lineno, .. } => *lineno,
    }
}

fn stmt_summary(stmt: &Stmt) -> String {
    match stmt {
        Stmt::Assign { target, .. } => format!("{target} = ..."),
        Stmt::Expr { .. } => "...".into(),
        Stmt::Raise { message, .. } => format!("raise {message}"),
        Stmt::Yield { .. } => "yield ...".into(),
        Stmt::YieldFrom { callee, .. } => format!("yield from {callee}()"),
        Stmt::Return { .. } => "return ...".into(),
        Stmt::Log { message, .. } => format!("log {message}"),
    }
}

/// Invoke callable `index` of `unit`. Generators are drained to
/// exhaustion and produce their last value.
fn invoke(
    inner: &Arc<Inner>,
    unit: &Arc<RewrittenUnit>,
    index: usize,
    args: Vec<Value>,
    in_library: bool,
    enclosing_bracketed: bool,
) -> std::result::Result<Value, TracedError> {
    let callable = &unit.unit.callables[index];
    if callable.is_generator() {
        let mut generator = TraceGenerator::new(
            Arc::clone(inner),
            Arc::clone(unit),
            index,
            args,
            in_library,
            enclosing_bracketed,
        );
        let mut last = Value::None;
        while let Some(value) = generator.resume_internal()? {
            last = value;
        }
        return Ok(last);
    }
    invoke_method(inner, unit, index, args, in_library, enclosing_bracketed)
}

fn bind_locals(callable: &Callable, args: Vec<Value>) -> BTreeMap<String, Value> {
    let mut locals = BTreeMap::new();
    let mut args = args.into_iter();
    for param in &callable.params {
        locals.insert(param.clone(), args.next().unwrap_or(Value::None));
    }
    locals
}

fn invoke_method(
    inner: &Arc<Inner>,
    unit: &Arc<RewrittenUnit>,
    index: usize,
    args: Vec<Value>,
    in_library: bool,
    enclosing_bracketed: bool,
) -> std::result::Result<Value, TracedError> {
    let callable = &unit.unit.callables[index];
    let plan = unit.plan_for(index);
    let bracketed = should_bracket(plan, in_library);
    let nested_in_library = child_context(plan, in_library);
    let nested_bracketed = enclosing_bracketed || bracketed;
    let mut locals = bind_locals(callable, args);

    if bracketed {
        emit_entry(inner, unit, callable, plan.unwrap(), &locals);
    }

    let mut result = Value::None;
    let outcome: std::result::Result<(), TracedError> = (|| {
        for stmt in &callable.body {
            match exec_stmt(
                inner,
                unit,
                callable,
                plan,
                &mut locals,
                stmt,
                nested_in_library,
                nested_bracketed,
            )? {
                StmtFlow::Continue => {}
                StmtFlow::Return(value) => {
                    result = value;
                    break;
                }
                StmtFlow::Yield(_) | StmtFlow::Delegate(_) => unreachable!("yield in non-generator"),
            }
        }
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            if bracketed {
                emit_exit(inner, plan.unwrap().kind, Status::Pass);
            }
            Ok(result)
        }
        Err(mut err) => {
            if bracketed {
                // method_except: the outermost bracketed frame reports
                // the full unwound stack exactly once; every bracketed
                // frame closes its element with ERROR, and the error
                // itself is never suppressed.
                if !enclosing_bracketed {
                    report_traceback(inner, &mut err);
                }
                emit_exit(inner, plan.unwrap().kind, Status::Error);
            }
            Err(err)
        }
    }
}

enum StmtFlow {
    Continue,
    Return(Value),
    Yield(Value),
    Delegate(TraceGenerator),
}

#[allow(clippy::too_many_arguments)]
fn exec_stmt(
    inner: &Arc<Inner>,
    unit: &Arc<RewrittenUnit>,
    callable: &Callable,
    plan: Option<&CallablePlan>,
    locals: &mut BTreeMap<String, Value>,
    stmt: &Stmt,
    nested_in_library: bool,
    nested_bracketed: bool,
) -> std::result::Result<StmtFlow, TracedError> {
    let trace_assigns = plan.map(|p| p.trace_assigns).unwrap_or(false);
    let result = match stmt {
        Stmt::Assign {
            lineno,
            target,
            value,
        } => {
            let value = eval(inner, locals, value, nested_in_library, nested_bracketed)?;
            locals.insert(target.clone(), value.clone());
            // The Assign event fires after the statement completes.
            if trace_assigns {
                inner.emit(LifecycleEvent::Assign {
                    source: unit.unit.source(),
                    lineno: *lineno,
                    target: target.clone(),
                    type_name: value.type_name().into(),
                    value: inner.rendered(target, &value),
                    time_delta: inner.clock.delta(),
                });
            }
            Ok(StmtFlow::Continue)
        }
        Stmt::Expr { value, .. } => {
            eval(inner, locals, value, nested_in_library, nested_bracketed)?;
            Ok(StmtFlow::Continue)
        }
        Stmt::Raise { message, .. } => Err(TracedError::new(message.clone())),
        Stmt::Return { value, .. } => {
            let value = eval(inner, locals, value, nested_in_library, nested_bracketed)?;
            Ok(StmtFlow::Return(value))
        }
        Stmt::Yield { value, .. } => {
            let value = eval(inner, locals, value, nested_in_library, nested_bracketed)?;
            Ok(StmtFlow::Yield(value))
        }
        Stmt::YieldFrom { callee, .. } => {
            let (target_unit, index) = find_in(inner, callee)
                .ok_or_else(|| TracedError::new(format!("callable not found: {callee}")))?;
            let generator = TraceGenerator::new(
                Arc::clone(inner),
                target_unit,
                index,
                Vec::new(),
                nested_in_library,
                nested_bracketed,
            );
            Ok(StmtFlow::Delegate(generator))
        }
        Stmt::Log {
            lineno,
            level,
            message,
        } => {
            inner.emit(LifecycleEvent::LogMessage {
                level: *level,
                message: message.clone(),
                html: false,
                source: unit.unit.source(),
                lineno: *lineno,
                time_delta: inner.clock.delta(),
            });
            Ok(StmtFlow::Continue)
        }
    };
    match result {
        Ok(flow) => Ok(flow),
        Err(mut err) => {
            push_frame(
                inner,
                &mut err,
                unit,
                callable,
                stmt_lineno(stmt),
                stmt_summary(stmt),
                locals,
            );
            Err(err)
        }
    }
}

fn find_in(inner: &Inner, name: &str) -> Option<(Arc<RewrittenUnit>, usize)> {
    let units = inner.units.read();
    for unit in units.iter() {
        if let Some(index) = unit.unit.callables.iter().position(|c| c.name == name) {
            return Some((Arc::clone(unit), index));
        }
    }
    None
}

fn eval(
    inner: &Arc<Inner>,
    locals: &BTreeMap<String, Value>,
    expr: &Expr,
    in_library: bool,
    enclosing_bracketed: bool,
) -> std::result::Result<Value, TracedError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Local(name) => Ok(locals.get(name).cloned().unwrap_or(Value::None)),
        Expr::Call { callee, args } => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(inner, locals, arg, in_library, enclosing_bracketed)?);
            }
            let (unit, index) = find_in(inner, callee)
                .ok_or_else(|| TracedError::new(format!("callable not found: {callee}")))?;
            invoke(inner, &unit, index, evaluated, in_library, enclosing_bracketed)
        }
    }
}

/// A suspendable activation, owned by the consumer that drives it.
///
/// Exactly one before/after (or except) triple brackets the whole
/// lifetime, creation to exhaustion or failure; abandoning a suspended
/// generator closes the triple on drop with no matching resume.
pub struct TraceGenerator {
    inner: Arc<Inner>,
    unit: Arc<RewrittenUnit>,
    index: usize,
    locals: BTreeMap<String, Value>,
    pc: usize,
    state: GenState,
    started_bracket: bool,
    in_library: bool,
    enclosing_bracketed: bool,
    delegate: Option<Box<TraceGenerator>>,
    last_suspend_lineno: i64,
    last_suspend_summary: String,
}

impl TraceGenerator {
    fn new(
        inner: Arc<Inner>,
        unit: Arc<RewrittenUnit>,
        index: usize,
        args: Vec<Value>,
        in_library: bool,
        enclosing_bracketed: bool,
    ) -> Self {
        let locals = bind_locals(&unit.unit.callables[index], args);
        Self {
            inner,
            unit,
            index,
            locals,
            pc: 0,
            state: GenState::Created,
            started_bracket: false,
            in_library,
            enclosing_bracketed,
            delegate: None,
            last_suspend_lineno: 0,
            last_suspend_summary: String::new(),
        }
    }

    pub fn state(&self) -> GenState {
        self.state
    }

    /// Re-enter the frame. `Ok(Some(v))` is a suspend handing `v` to
    /// the consumer; `Ok(None)` is exhaustion.
    pub fn resume(&mut self) -> Result<Option<Value>> {
        match self.state {
            GenState::Done | GenState::Failed => Err(RuntraceError::GeneratorExhausted(
                self.callable().name.clone(),
            )),
            _ => match self.resume_internal() {
                Ok(value) => Ok(value),
                Err(mut err) => {
                    if !err.reported {
                        report_traceback(&self.inner, &mut err);
                    }
                    Err(RuntraceError::TracedFailure(err.message))
                }
            },
        }
    }

    fn callable(&self) -> &Callable {
        &self.unit.unit.callables[self.index]
    }

    fn plan(&self) -> Option<&CallablePlan> {
        self.unit.plan_for(self.index)
    }

    fn trace_yields(&self) -> bool {
        self.plan().map(|p| p.trace_yields).unwrap_or(false)
            && should_bracket(self.plan(), self.in_library)
    }

    fn yield_site(&self) -> (String, String, String) {
        (
            self.callable().name.clone(),
            self.unit.unit.name.clone(),
            self.unit.unit.source(),
        )
    }

    fn resume_internal(&mut self) -> std::result::Result<Option<Value>, TracedError> {
        match self.state {
            GenState::Created => {
                if should_bracket(self.plan(), self.in_library) {
                    let locals = self.locals.clone();
                    emit_entry(
                        &self.inner,
                        &self.unit,
                        self.callable(),
                        self.plan().unwrap(),
                        &locals,
                    );
                    self.started_bracket = true;
                }
                self.state = GenState::Running;
            }
            GenState::Suspended => {
                // A delegation resume is covered by YieldFromResume
                // when the delegate exhausts, not by a per-item YR.
                if self.trace_yields() && self.delegate.is_none() {
                    let (name, libname, source) = self.yield_site();
                    self.inner.emit(LifecycleEvent::YieldResume {
                        name,
                        libname,
                        source,
                        lineno: self.last_suspend_lineno,
                        time_delta: self.inner.clock.delta(),
                    });
                }
                self.state = GenState::Running;
            }
            GenState::Running => {}
            GenState::Done | GenState::Failed => return Ok(None),
        }

        match self.step() {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                if self.started_bracket {
                    emit_exit(&self.inner, self.plan().unwrap().kind, Status::Pass);
                }
                self.state = GenState::Done;
                Ok(None)
            }
            Err(mut err) => {
                if self.started_bracket {
                    if !self.enclosing_bracketed {
                        report_traceback(&self.inner, &mut err);
                    }
                    emit_exit(&self.inner, self.plan().unwrap().kind, Status::Error);
                }
                self.state = GenState::Failed;
                Err(err)
            }
        }
    }

    /// Advance to the next suspend point or to exhaustion.
    fn step(&mut self) -> std::result::Result<Option<Value>, TracedError> {
        loop {
            // An active delegation forwards the sub-iteration's values;
            // per-item events are not emitted for the delegating frame.
            if let Some(delegate) = self.delegate.as_mut() {
                match delegate.resume_internal() {
                    Ok(Some(value)) => {
                        // Handing a delegated value out suspends this
                        // frame too, so abandonment still closes it.
                        self.state = GenState::Suspended;
                        return Ok(Some(value));
                    }
                    Ok(None) => {
                        self.delegate = None;
                        if self.trace_yields() {
                            let (name, libname, source) =
                                self.yield_site();
                            self.inner.emit(LifecycleEvent::YieldFromResume {
                                name,
                                libname,
                                source,
                                lineno: self.last_suspend_lineno,
                                time_delta: self.inner.clock.delta(),
                            });
                        }
                    }
                    Err(mut err) => {
                        // The delegating frame belongs in the unwound
                        // stack too.
                        let callable = self.callable().clone();
                        push_frame(
                            &self.inner,
                            &mut err,
                            &self.unit,
                            &callable,
                            self.last_suspend_lineno,
                            self.last_suspend_summary.clone(),
                            &self.locals,
                        );
                        return Err(err);
                    }
                }
            }

            let body_len = self.callable().body.len();
            if self.pc >= body_len {
                return Ok(None);
            }
            let stmt = self.callable().body[self.pc].clone();
            let plan = self.plan().cloned();
            let nested_in_library = child_context(plan.as_ref(), self.in_library);
            let nested_bracketed = self.enclosing_bracketed || self.started_bracket;
            let inner = Arc::clone(&self.inner);
            let unit = Arc::clone(&self.unit);
            let callable = self.callable().clone();
            let flow = exec_stmt(
                &inner,
                &unit,
                &callable,
                plan.as_ref(),
                &mut self.locals,
                &stmt,
                nested_in_library,
                nested_bracketed,
            )?;
            self.pc += 1;
            match flow {
                StmtFlow::Continue => {}
                StmtFlow::Return(_) => return Ok(None),
                StmtFlow::Yield(value) => {
                    let lineno = stmt_lineno(&stmt);
                    self.last_suspend_lineno = lineno;
                    self.last_suspend_summary = stmt_summary(&stmt);
                    if self.trace_yields() {
                        let (name, libname, source) = self.yield_site();
                        self.inner.emit(LifecycleEvent::YieldSuspend {
                            name,
                            libname,
                            source,
                            lineno,
                            type_name: value.type_name().into(),
                            value: value.to_string(),
                            time_delta: self.inner.clock.delta(),
                        });
                    }
                    self.state = GenState::Suspended;
                    return Ok(Some(value));
                }
                StmtFlow::Delegate(generator) => {
                    let lineno = stmt_lineno(&stmt);
                    self.last_suspend_lineno = lineno;
                    self.last_suspend_summary = stmt_summary(&stmt);
                    // One suspend/resume pair per delegation, not per
                    // delegated item.
                    if self.trace_yields() {
                        let (name, libname, source) = self.yield_site();
                        self.inner.emit(LifecycleEvent::YieldFromSuspend {
                            name,
                            libname,
                            source,
                            lineno,
                            time_delta: self.inner.clock.delta(),
                        });
                    }
                    self.delegate = Some(Box::new(generator));
                }
            }
        }
    }
}

impl Drop for TraceGenerator {
    fn drop(&mut self) {
        // An abandoned suspended generator still closes its bracketing
        // triple; the final suspend keeps no matching resume. An active
        // delegate closes first so the brackets stay nested.
        self.delegate = None;
        if self.state == GenState::Suspended && self.started_bracket {
            if let Some(plan) = self.plan() {
                emit_exit(&self.inner, plan.kind, Status::Pass);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EntryKind;
    use crate::filter::{Filter, FilterKind};
    use crate::unit::{Callable, Expr, SourceUnit, Stmt, Value};
    use parking_lot::Mutex;

    fn collector(registry: &Arc<HookRegistry>) -> (Arc<Mutex<Vec<LifecycleEvent>>>, Vec<crate::registry::HookHandle>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handles = registry.subscribe_all(move |e| sink.lock().push(e.clone()));
        (events, handles)
    }

    fn tags(events: &[LifecycleEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.tag()).collect()
    }

    fn project_unit() -> SourceUnit {
        SourceUnit::new("/proj/tasks.rs", "tasks")
            .with_callable(
                Callable::new("greet", 3)
                    .with_params(["who"])
                    .with_body(vec![
                        Stmt::Assign {
                            lineno: 4,
                            target: "msg".into(),
                            value: Expr::Literal(Value::Str("hello".into())),
                        },
                        Stmt::Return {
                            lineno: 5,
                            value: Expr::Local("msg".into()),
                        },
                    ]),
            )
    }

    #[test]
    fn test_call_emits_bracketing_triple() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.load(project_unit()).unwrap();

        let result = rt.call("greet", vec![Value::Str("world".into())]).unwrap();
        assert_eq!(result, Value::Str("hello".into()));

        let events = events.lock();
        let tags = tags(&events);
        assert_eq!(tags, vec!["SE", "EA", "AS", "EE"]);
        match &events[3] {
            LifecycleEvent::ElementEnd { status, kind, .. } => {
                assert_eq!(*status, Status::Pass);
                assert_eq!(*kind, EntryKind::Method);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_boundary_only_nested_calls_single_pair() {
        // Three levels of library-internal calls entered once from
        // outside bracket exactly one element.
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let config = TraceConfig::full_log().with_filter(Filter {
            name: "/lib".into(),
            kind: FilterKind::LogOnProjectCall,
        });
        let rt = Runtime::new(Arc::clone(&registry), config);
        let call = |callee: &str, lineno| Stmt::Expr {
            lineno,
            value: Expr::Call {
                callee: callee.into(),
                args: vec![],
            },
        };
        rt.load(
            SourceUnit::new("/lib/net.rs", "net")
                .with_callable(Callable::new("outer", 1).with_body(vec![call("mid", 2)]))
                .with_callable(Callable::new("mid", 10).with_body(vec![call("inner", 11)]))
                .with_callable(Callable::new("inner", 20).with_body(vec![Stmt::Return {
                    lineno: 21,
                    value: Expr::Literal(Value::Int(7)),
                }])),
        )
        .unwrap();

        rt.call("outer", vec![]).unwrap();

        let events = events.lock();
        assert_eq!(tags(&events), vec!["SE", "EE"]);
        match &events[0] {
            LifecycleEvent::ElementStart { name, .. } => assert_eq!(name, "outer"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_error_reports_traceback_exactly_once() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.load(
            SourceUnit::new("/proj/fail.rs", "fail")
                .with_callable(Callable::new("entry", 1).with_body(vec![Stmt::Expr {
                    lineno: 2,
                    value: Expr::Call {
                        callee: "boom".into(),
                        args: vec![],
                    },
                }]))
                .with_callable(Callable::new("boom", 10).with_body(vec![Stmt::Raise {
                    lineno: 11,
                    message: "division by zero".into(),
                }])),
        )
        .unwrap();

        let err = rt.call("entry", vec![]).unwrap_err();
        assert!(matches!(err, RuntraceError::TracedFailure(_)));

        let events = events.lock();
        let tags = tags(&events);
        assert_eq!(tags.iter().filter(|t| **t == "STB").count(), 1);
        assert_eq!(tags.iter().filter(|t| **t == "ETB").count(), 1);
        // Both activations still close, with ERROR status.
        let errored: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::ElementEnd { status: Status::Error, .. }))
            .collect();
        assert_eq!(errored.len(), 2);
        // Outermost frame first in the traceback entries.
        let entries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::TracebackEntry { method, .. } => Some(method.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(entries, vec!["entry", "boom"]);
    }

    #[test]
    fn test_sensitive_argument_redacted() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.load(
            SourceUnit::new("/proj/login.rs", "login").with_callable(
                Callable::new("login", 1)
                    .with_params(["user", "password"])
                    .with_body(vec![Stmt::Return {
                        lineno: 2,
                        value: Expr::Literal(Value::Bool(true)),
                    }]),
            ),
        )
        .unwrap();

        rt.call(
            "login",
            vec![Value::Str("bob".into()), Value::Str("hunter2".into())],
        )
        .unwrap();

        let events = events.lock();
        let args: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::Argument { name, value, .. } => {
                    Some((name.as_str(), value.as_str()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(args, vec![("user", "bob"), ("password", "<redacted>")]);
    }

    #[test]
    fn test_generator_suspend_resume_and_abandonment() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.load(
            SourceUnit::new("/proj/gen.rs", "gen").with_callable(
                Callable::new("counter", 1).with_body(vec![
                    Stmt::Yield {
                        lineno: 2,
                        value: Expr::Literal(Value::Int(1)),
                    },
                    Stmt::Yield {
                        lineno: 3,
                        value: Expr::Literal(Value::Int(2)),
                    },
                ]),
            ),
        )
        .unwrap();

        let mut gen = rt.call_generator("counter", vec![]).unwrap();
        assert_eq!(gen.state(), GenState::Created);
        assert_eq!(gen.resume().unwrap(), Some(Value::Int(1)));
        assert_eq!(gen.state(), GenState::Suspended);
        drop(gen);

        let events = events.lock();
        // Abandoned mid-iteration: triple still closes, the final
        // suspend has no matching resume.
        assert_eq!(tags(&events), vec!["SE", "YS", "EE"]);
        match &events[0] {
            LifecycleEvent::ElementStart { kind, .. } => {
                assert_eq!(*kind, EntryKind::Generator)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_yield_from_emits_one_pair_per_delegation() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.load(delegating_unit(vec![
            Stmt::Yield {
                lineno: 11,
                value: Expr::Literal(Value::Int(1)),
            },
            Stmt::Yield {
                lineno: 12,
                value: Expr::Literal(Value::Int(2)),
            },
        ]))
        .unwrap();

        let mut gen = rt.call_generator("outer", vec![]).unwrap();
        let mut seen = Vec::new();
        while let Some(value) = gen.resume().unwrap() {
            seen.push(value);
        }
        assert_eq!(seen, vec![Value::Int(1), Value::Int(2)]);

        let events = events.lock();
        let tags = tags(&events);
        assert_eq!(tags.iter().filter(|t| **t == "YFS").count(), 1);
        assert_eq!(tags.iter().filter(|t| **t == "YFR").count(), 1);
    }

    fn delegating_unit(inner_body: Vec<Stmt>) -> SourceUnit {
        SourceUnit::new("/proj/delegate.rs", "delegate")
            .with_callable(Callable::new("outer", 1).with_body(vec![Stmt::YieldFrom {
                lineno: 2,
                callee: "inner".into(),
            }]))
            .with_callable(Callable::new("inner", 10).with_body(inner_body))
    }

    #[test]
    fn test_abandoned_delegation_closes_outer_bracket() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.load(delegating_unit(vec![
            Stmt::Yield {
                lineno: 11,
                value: Expr::Literal(Value::Int(1)),
            },
            Stmt::Yield {
                lineno: 12,
                value: Expr::Literal(Value::Int(2)),
            },
        ]))
        .unwrap();

        let mut gen = rt.call_generator("outer", vec![]).unwrap();
        assert_eq!(gen.resume().unwrap(), Some(Value::Int(1)));
        drop(gen);

        let events = events.lock();
        let tags = tags(&events);
        // Dropped mid-delegation: the delegate closes first, then the
        // delegating frame, so every SE has its EE.
        assert_eq!(tags, vec!["SE", "YFS", "SE", "YS", "EE", "EE"]);
        assert_eq!(
            tags.iter().filter(|t| **t == "SE").count(),
            tags.iter().filter(|t| **t == "EE").count()
        );
    }

    #[test]
    fn test_delegate_error_traceback_includes_delegating_frame() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.load(delegating_unit(vec![Stmt::Raise {
            lineno: 11,
            message: "backend closed".into(),
        }]))
        .unwrap();

        let mut gen = rt.call_generator("outer", vec![]).unwrap();
        let err = gen.resume().unwrap_err();
        assert!(matches!(err, RuntraceError::TracedFailure(_)));

        let events = events.lock();
        let tags = tags(&events);
        assert_eq!(tags.iter().filter(|t| **t == "STB").count(), 1);
        let entries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::TracebackEntry { method, .. } => Some(method.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(entries, vec!["outer", "inner"]);
        let errored = events
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::ElementEnd { status: Status::Error, .. }))
            .count();
        assert_eq!(errored, 2);
    }

    #[test]
    fn test_hidden_value_scrubbed_from_output() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.hide_value("hunter2");
        rt.load(
            SourceUnit::new("/proj/login.rs", "login").with_callable(
                Callable::new("login", 1)
                    .with_params(["token"])
                    .with_body(vec![Stmt::Return {
                        lineno: 2,
                        value: Expr::Literal(Value::Bool(true)),
                    }]),
            ),
        )
        .unwrap();

        rt.call("login", vec![Value::Str("hunter2".into())]).unwrap();
        rt.log_message(LogLevel::Info, "credential hunter2 accepted", false, "/proj/login.rs", 9);

        let events = events.lock();
        // The secret never leaves by value, whatever the variable name.
        match events.iter().find(|e| e.tag() == "EA") {
            Some(LifecycleEvent::Argument { value, .. }) => assert_eq!(value, "<redacted>"),
            other => panic!("unexpected event: {other:?}"),
        }
        match events.iter().find(|e| e.tag() == "L") {
            Some(LifecycleEvent::LogMessage { message, .. }) => {
                assert_eq!(message, "credential <redacted> accepted")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_suppress_scope_drops_traced_events() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.load(project_unit()).unwrap();

        let guard = rt.suppress();
        rt.call("greet", vec![Value::Str("world".into())]).unwrap();
        rt.log_message(LogLevel::Info, "still visible", false, "/proj/tasks.rs", 5);
        drop(guard);
        rt.call("greet", vec![Value::Str("world".into())]).unwrap();

        let events = events.lock();
        let tags = tags(&events);
        // Only the explicit log message survives the scope; the second
        // call traces normally.
        assert_eq!(tags, vec!["L", "SE", "EA", "AS", "EE"]);
    }

    #[test]
    fn test_suppress_variables_keeps_brackets() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.load(project_unit()).unwrap();

        let guard = rt.suppress_variables();
        rt.call("greet", vec![Value::Str("world".into())]).unwrap();
        drop(guard);

        let events = events.lock();
        assert_eq!(tags(&events), vec!["SE", "EE"]);
    }

    #[test]
    fn test_run_task_brackets_with_status() {
        let registry = Arc::new(HookRegistry::new());
        let (events, _handles) = collector(&registry);
        let rt = Runtime::new(Arc::clone(&registry), TraceConfig::full_log());
        rt.load(project_unit()).unwrap();

        rt.start_run("suite");
        rt.run_task("greet").unwrap();
        rt.end_run(Status::Pass);

        let events = events.lock();
        let tags = tags(&events);
        assert_eq!(tags.first(), Some(&"SR"));
        assert_eq!(tags.get(1), Some(&"ST"));
        assert!(tags.contains(&"ET"));
        assert_eq!(tags.last(), Some(&"ER"));
        match events.iter().find(|e| e.tag() == "ET") {
            Some(LifecycleEvent::TaskEnd { status, .. }) => assert_eq!(*status, Status::Pass),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
