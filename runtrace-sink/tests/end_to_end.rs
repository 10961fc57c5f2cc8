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

//! Whole-pipeline tests: instrumented execution through the hook
//! registry into a file sink, then decoded back.

use runtrace_core::{
    Callable, Expr, Filter, FilterKind, HookRegistry, LifecycleEvent, LogLevel, SourceUnit, Stmt,
    Status, TraceConfig, Value,
};
use runtrace_sink::TraceLogger;
use runtrace_wire::{count_messages, decode_all, verify_messages, Decoded, Expected};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn decode_file(path: &Path) -> Vec<Decoded> {
    let text = std::fs::read_to_string(path).unwrap();
    decode_all(&text).unwrap()
}

fn runtime_with_logger(
    dir: &Path,
    config: TraceConfig,
    max_bytes: u64,
    max_files: usize,
) -> (
    runtrace_core::Runtime,
    Arc<TraceLogger>,
    Vec<runtrace_core::HookHandle>,
) {
    let registry = Arc::new(HookRegistry::new());
    let logger = TraceLogger::to_dir(dir, max_bytes, max_files).unwrap();
    let handles = logger.attach(&registry);
    let rt = runtrace_core::Runtime::new(registry, config);
    (rt, logger, handles)
}

#[test]
fn test_failing_task_decodes_with_single_traceback() {
    let dir = tempfile::tempdir().unwrap();
    let (rt, logger, handles) =
        runtime_with_logger(dir.path(), TraceConfig::full_log(), 1024 * 1024, 5);

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

    rt.start_run("suite");
    assert!(rt.run_task("entry").is_err());
    rt.end_run(Status::Error);

    drop(handles);
    let files = logger.close().unwrap();
    assert_eq!(files.len(), 1);

    let decoded = decode_file(&files[0]);
    verify_messages(
        &decoded,
        &[
            Expected::new("SR").field("name", json!("suite")),
            Expected::new("ST").field("name", json!("entry")),
            Expected::new("STB").field("message", json!("division by zero")),
            Expected::new("TBE")
                .field("method", json!("boom"))
                .field("lineno", json!(11)),
            Expected::new("ET")
                .field("status", json!("ERROR"))
                .field("message", json!("Traced code failed: division by zero")),
            Expected::new("ER").field("status", json!("ERROR")),
        ],
    )
    .unwrap();

    // The traceback block appears exactly once even though the error
    // crossed two instrumented activations.
    assert_eq!(count_messages(&decoded, "STB"), 1);
    assert_eq!(count_messages(&decoded, "ETB"), 1);
    assert_eq!(count_messages(&decoded, "SE"), 2);
    assert_eq!(count_messages(&decoded, "EE"), 2);
}

#[test]
fn test_library_chain_brackets_boundary_only() {
    let dir = tempfile::tempdir().unwrap();
    let config = TraceConfig::full_log().with_filter(Filter {
        name: "/lib".into(),
        kind: FilterKind::LogOnProjectCall,
    });
    let (rt, logger, handles) = runtime_with_logger(dir.path(), config, 1024 * 1024, 5);

    let call = |callee: &str, lineno| Stmt::Expr {
        lineno,
        value: Expr::Call {
            callee: callee.into(),
            args: vec![],
        },
    };
    rt.load(
        SourceUnit::new("/lib/net.rs", "net")
            .with_callable(Callable::new("fetch", 1).with_body(vec![call("connect", 2)]))
            .with_callable(Callable::new("connect", 10).with_body(vec![call("resolve", 11)]))
            .with_callable(Callable::new("resolve", 20).with_body(vec![Stmt::Return {
                lineno: 21,
                value: Expr::Literal(Value::Str("10.0.0.1".into())),
            }])),
    )
    .unwrap();

    rt.call("fetch", vec![]).unwrap();

    drop(handles);
    let files = logger.close().unwrap();
    let decoded = decode_file(&files[0]);

    // One SE/EE pair for the whole chain, for the entry point only.
    assert_eq!(count_messages(&decoded, "SE"), 1);
    assert_eq!(count_messages(&decoded, "EE"), 1);
    verify_messages(
        &decoded,
        &[Expected::new("SE")
            .field("name", json!("fetch"))
            .field("type", json!("METHOD"))],
    )
    .unwrap();
}

#[test]
fn test_rotated_segments_decode_standalone() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(HookRegistry::new());
    // Small segments, keep only the 3 newest.
    let logger = TraceLogger::to_dir(dir.path(), 512, 3).unwrap();
    let _handles = logger.attach(&registry);

    for i in 0..60 {
        registry.dispatch(&LifecycleEvent::LogMessage {
            level: LogLevel::Info,
            message: format!("progress step {i}"),
            html: false,
            source: "/proj/tasks.rs".into(),
            lineno: 40 + i,
            time_delta: i as f64 / 10.0,
        });
    }

    let files = logger.close().unwrap();
    assert_eq!(files.len(), 3);
    assert!(!dir.path().join("output.robolog").exists());

    // Every surviving segment decodes with a fresh decoder: headers and
    // memo entries were re-emitted on rotation.
    for file in &files {
        let decoded = decode_file(file);
        assert_eq!(decoded[0].message_type, "V");
        assert_eq!(decoded[1].message_type, "T");
        assert_eq!(decoded[2].message_type, "ID");
        let logs: Vec<_> = decoded.iter().filter(|d| d.message_type == "L").collect();
        assert!(!logs.is_empty());
        for log in logs {
            assert!(log.str_field("message").is_some(), "oid failed to resolve");
            assert_eq!(log.str_field("source"), Some("/proj/tasks.rs"));
        }
    }

    // Part numbers keep increasing across rotations.
    let last = decode_file(files.last().unwrap());
    let part = last
        .iter()
        .find(|d| d.message_type == "ID")
        .and_then(|d| d.field("part"))
        .and_then(|v| v.as_i64())
        .unwrap();
    assert!(part >= 3);
}

#[test]
fn test_generator_events_survive_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let (rt, logger, handles) =
        runtime_with_logger(dir.path(), TraceConfig::full_log(), 1024 * 1024, 5);

    rt.load(
        SourceUnit::new("/proj/gen.rs", "gen").with_callable(
            Callable::new("steps", 1).with_body(vec![
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

    rt.call("steps", vec![]).unwrap();

    drop(handles);
    let files = logger.close().unwrap();
    let decoded = decode_file(&files[0]);

    verify_messages(
        &decoded,
        &[
            Expected::new("SE")
                .field("name", json!("steps"))
                .field("type", json!("GENERATOR")),
            Expected::new("YS")
                .field("value", json!("1"))
                .field("lineno", json!(2)),
            Expected::new("EE")
                .field("type", json!("GENERATOR"))
                .field("status", json!("PASS")),
        ],
    )
    .unwrap();
    assert_eq!(count_messages(&decoded, "YS"), 2);
    assert_eq!(count_messages(&decoded, "YR"), 2);
}
