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

//! Language-neutral source unit representation
//!
//! Instead of mutating host-language ASTs at load time, callables are
//! described in a small call/scope IR and the instrumenter plans hook
//! points over it. A [`SourceUnit`] is a compilable unit identified by
//! a stable path; it is immutable once instrumented.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A runtime value flowing through traced code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Type tag recorded in Assign/Argument/YieldSuspend events.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

/// An expression evaluated by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    /// Read of a local binding or parameter.
    Local(String),
    /// Call of another callable, resolved by name across loaded units.
    Call { callee: String, args: Vec<Expr> },
}

/// A statement in a callable body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Bind a name; traced as an `Assign` event after completion.
    Assign {
        lineno: i64,
        target: String,
        value: Expr,
    },
    /// Evaluate for effect only.
    Expr { lineno: i64, value: Expr },
    /// Raise an error with the given message.
    Raise { lineno: i64, message: String },
    /// Suspend, handing `value` to the consumer. Only valid in
    /// generators.
    Yield { lineno: i64, value: Expr },
    /// Delegate the whole sub-iteration to another generator callable.
    YieldFrom { lineno: i64, callee: String },
    /// Terminate the callable with `value` as its result.
    Return { lineno: i64, value: Expr },
    /// Explicit log message from traced code.
    Log {
        lineno: i64,
        level: crate::event::LogLevel,
        message: String,
    },
}

/// A callable definition inside a source unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callable {
    pub name: String,
    pub lineno: i64,
    pub doc: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

impl Callable {
    pub fn new(name: impl Into<String>, lineno: i64) -> Self {
        Self {
            name: name.into(),
            lineno,
            doc: String::new(),
            params: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn with_params(mut self, params: impl IntoIterator<Item = &'static str>) -> Self {
        self.params = params.into_iter().map(String::from).collect();
        self
    }

    pub fn with_body(mut self, body: Vec<Stmt>) -> Self {
        self.body = body;
        self
    }

    /// Whether the body contains a suspend point.
    pub fn is_generator(&self) -> bool {
        self.body
            .iter()
            .any(|s| matches!(s, Stmt::Yield { .. } | Stmt::YieldFrom { .. }))
    }

    /// Docstring-only or trivially empty bodies produce no events of
    /// value and are left unrewritten.
    pub fn is_trivial(&self) -> bool {
        self.body.is_empty()
    }
}

/// A compilable unit of code identified by a stable path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Stable location used by the classifier.
    pub path: PathBuf,
    /// Library/module name recorded as `libname` in events.
    pub name: String,
    pub callables: Vec<Callable>,
}

impl SourceUnit {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            callables: Vec::new(),
        }
    }

    pub fn with_callable(mut self, callable: Callable) -> Self {
        self.callables.push(callable);
        self
    }

    pub fn callable(&self, name: &str) -> Option<&Callable> {
        self.callables.iter().find(|c| c.name == name)
    }

    /// Source string recorded in events for this unit.
    pub fn source(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}
