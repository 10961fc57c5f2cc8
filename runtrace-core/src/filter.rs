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

//! Filter configuration and the source-unit classifier
//!
//! Pure path logic: classification never loads unit code, since it
//! decides whether instrumentation happens at all. One configuration is
//! active per process; units pick it up at instrumentation time and are
//! never retro-patched.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How deeply a source unit is instrumented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentationPolicy {
    /// No hooks inserted.
    None,
    /// Hooks only at the outermost call entering/leaving the unit's
    /// code. Used for library units reached from project code.
    BoundaryOnly,
    /// Every call, assignment and suspend point is hooked.
    Full,
}

/// The filtering strategy for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKind {
    /// Ignore the project/library distinction: everything is Full.
    FullLog,
    /// Full for units inside a configured project root, BoundaryOnly
    /// for everything else.
    LogOnProjectCall,
    /// Tracing disabled.
    Exclude,
}

/// An explicit per-path override, checked before root containment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    /// Path prefix the filter applies to.
    pub name: PathBuf,
    pub kind: FilterKind,
}

/// Active trace configuration.
///
/// Project roots are canonicalized (symlink-resolved) at construction;
/// paths that cannot be resolved at classification time fail closed to
/// [`InstrumentationPolicy::BoundaryOnly`].
#[derive(Debug, Clone)]
pub struct TraceConfig {
    kind: FilterKind,
    project_roots: Vec<PathBuf>,
    filters: Vec<Filter>,
    trace_assigns: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self::full_log()
    }
}

impl TraceConfig {
    /// Configuration which instruments every unit fully.
    pub fn full_log() -> Self {
        Self {
            kind: FilterKind::FullLog,
            project_roots: Vec::new(),
            filters: Vec::new(),
            trace_assigns: true,
        }
    }

    /// Configuration which instruments project code fully and brackets
    /// library code at its boundary only.
    pub fn log_on_project_call(project_roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let project_roots = project_roots
            .into_iter()
            .map(|p| normalize(&p).unwrap_or(p))
            .collect();
        Self {
            kind: FilterKind::LogOnProjectCall,
            project_roots,
            filters: Vec::new(),
            trace_assigns: true,
        }
    }

    /// Configuration with tracing disabled.
    pub fn disabled() -> Self {
        Self {
            kind: FilterKind::Exclude,
            project_roots: Vec::new(),
            filters: Vec::new(),
            trace_assigns: false,
        }
    }

    /// Add an explicit per-prefix override, checked before root
    /// containment.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Toggle assignment tracing (default on for Full).
    pub fn with_trace_assigns(mut self, trace_assigns: bool) -> Self {
        self.trace_assigns = trace_assigns;
        self
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn trace_assigns(&self) -> bool {
        self.trace_assigns
    }

    /// Classify a source unit location.
    pub fn classify(&self, path: &Path) -> InstrumentationPolicy {
        for filter in &self.filters {
            if is_inside(path, &filter.name) {
                return policy_for(filter.kind);
            }
        }

        match self.kind {
            FilterKind::Exclude => InstrumentationPolicy::None,
            FilterKind::FullLog => InstrumentationPolicy::Full,
            FilterKind::LogOnProjectCall => {
                let resolved = match normalize(path) {
                    Some(p) => p,
                    // Unresolvable/relative paths fail closed.
                    None => return InstrumentationPolicy::BoundaryOnly,
                };
                if self.project_roots.iter().any(|root| resolved.starts_with(root)) {
                    InstrumentationPolicy::Full
                } else {
                    InstrumentationPolicy::BoundaryOnly
                }
            }
        }
    }
}

fn policy_for(kind: FilterKind) -> InstrumentationPolicy {
    match kind {
        FilterKind::FullLog => InstrumentationPolicy::Full,
        FilterKind::LogOnProjectCall => InstrumentationPolicy::BoundaryOnly,
        FilterKind::Exclude => InstrumentationPolicy::None,
    }
}

/// Symlink-resolved, case-normalized absolute form of `path`, or `None`
/// when it cannot be resolved.
fn normalize(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let canonical = std::fs::canonicalize(path).ok()?;
    if cfg!(windows) {
        Some(PathBuf::from(canonical.to_string_lossy().to_lowercase()))
    } else {
        Some(canonical)
    }
}

fn is_inside(path: &Path, prefix: &Path) -> bool {
    match (normalize(path), normalize(prefix)) {
        (Some(p), Some(pre)) => p.starts_with(&pre),
        _ => path.starts_with(prefix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_log_classifies_everything_full() {
        let dir = tempfile::tempdir().unwrap();
        let config = TraceConfig::full_log();
        assert_eq!(config.classify(dir.path()), InstrumentationPolicy::Full);
        assert_eq!(
            config.classify(Path::new("relative/module.unit")),
            InstrumentationPolicy::Full
        );
    }

    #[test]
    fn test_project_root_containment() {
        let project = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let inside = project.path().join("tasks");
        std::fs::create_dir(&inside).unwrap();

        let config = TraceConfig::log_on_project_call([project.path().to_path_buf()]);
        assert_eq!(config.classify(&inside), InstrumentationPolicy::Full);
        assert_eq!(
            config.classify(library.path()),
            InstrumentationPolicy::BoundaryOnly
        );
    }

    #[test]
    fn test_unresolvable_path_fails_closed() {
        let project = tempfile::tempdir().unwrap();
        let config = TraceConfig::log_on_project_call([project.path().to_path_buf()]);
        assert_eq!(
            config.classify(Path::new("not/absolute.unit")),
            InstrumentationPolicy::BoundaryOnly
        );
        assert_eq!(
            config.classify(Path::new("/definitely/not/there/x.unit")),
            InstrumentationPolicy::BoundaryOnly
        );
    }

    #[test]
    fn test_explicit_filter_overrides_roots() {
        let project = tempfile::tempdir().unwrap();
        let vendored = project.path().join("vendored");
        std::fs::create_dir(&vendored).unwrap();

        let config = TraceConfig::log_on_project_call([project.path().to_path_buf()])
            .with_filter(Filter {
                name: vendored.clone(),
                kind: FilterKind::LogOnProjectCall,
            });
        // The override demotes a path inside the project root.
        assert_eq!(
            config.classify(&vendored),
            InstrumentationPolicy::BoundaryOnly
        );
        assert_eq!(
            config.classify(project.path()),
            InstrumentationPolicy::Full
        );
    }

    #[test]
    fn test_disabled_classifies_none() {
        let config = TraceConfig::disabled();
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(config.classify(dir.path()), InstrumentationPolicy::None);
    }
}
