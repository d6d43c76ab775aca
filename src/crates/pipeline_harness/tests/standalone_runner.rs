#![cfg(feature = "test-support")]

#[path = "harness_support.rs"]
mod support;

use std::time::Duration;

use pipeline_harness::{
    run_session, run_standalone, CaseStatus, DaemonConfig, PipelineDescriptor, PipelineSpec,
    TestCase, TestDaemon,
};
use serde_json::json;
use tempfile::tempdir;
use tracing::Span;

use support::{engine_config, fields, filter_config};

#[test]
fn failing_cases_are_reported_without_stopping_the_run() {
    let dir = tempdir().expect("tempdir");
    let config = engine_config(dir.path());

    let cases = vec![
        TestCase::new("passes")
            .with_input("hello")
            .expecting(json!({"message": "hello"})),
        TestCase::new("fails")
            .with_input("x")
            .expecting(json!({"message": "y"})),
        TestCase::new("ordered")
            .with_input("1")
            .with_input("2")
            .with_input("3")
            .expecting(json!({"message": "1"}))
            .expecting(json!({"message": "2"}))
            .expecting(json!({"message": "3"})),
        TestCase::new("with fields")
            .with_codec("json_lines")
            .with_fields(fields(json!({"type": "app"})))
            .with_input(r#"{"level":"info"}"#)
            .expecting(json!({"level": "info", "type": "app"})),
        TestCase::new("no input"),
    ];

    let summary = run_standalone(&config, &cases, false, Span::none()).expect("run");
    assert_eq!(summary.outcomes.len(), cases.len());
    assert!(!summary.success());

    let failures: Vec<_> = summary.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].name, "fails");
    assert_eq!(
        failures[0].status,
        CaseStatus::Mismatch {
            expected: vec![json!({"message": "y"})],
            actual: vec![json!({"message": "x"})],
        }
    );
}

#[test]
fn a_case_that_cannot_be_fed_does_not_stop_the_others() {
    let dir = tempdir().expect("tempdir");
    let config = engine_config(dir.path())
        .with_env("FAKE_ENGINE_SKIP_INPUT", "1")
        .with_write_timeout(Duration::from_millis(500));

    let cases = vec![
        TestCase::new("before")
            .with_input("a")
            .expecting(json!({"message": "a"})),
        TestCase::new("never connected")
            .with_input("b")
            .expecting(json!({"message": "b"})),
        TestCase::new("after")
            .with_input("c")
            .expecting(json!({"message": "c"})),
    ];

    let summary = run_standalone(&config, &cases, false, Span::none()).expect("run");
    assert_eq!(summary.outcomes.len(), 3);
    assert!(summary.outcomes[0].passed());
    assert!(matches!(
        &summary.outcomes[1].status,
        CaseStatus::Error(message) if message.contains("did not connect")
    ));
    assert!(summary.outcomes[2].passed());
}

#[test]
fn session_runner_tears_down_after_running_all_cases() {
    let dir = tempdir().expect("tempdir");
    let daemon = TestDaemon::new(DaemonConfig::new(engine_config(dir.path())), Span::none());
    let descriptor = PipelineDescriptor::new(
        PipelineSpec::new("main").with_config(filter_config(dir.path(), "main.conf", "main-id")),
    )
    .with_slots(4);

    let cases = vec![
        TestCase::new("first")
            .with_input(r#"{"n":1}"#)
            .expecting(json!({"n": 1})),
        TestCase::new("second")
            .with_fields(fields(json!({"tag": "b"})))
            .with_input(r#"{"n":2}"#)
            .with_input(r#"{"n":3}"#)
            .expecting(json!({"n": 2, "tag": "b"}))
            .expecting(json!({"n": 3, "tag": "b"})),
        TestCase::new("wrong")
            .with_input(r#"{"n":4}"#)
            .expecting(json!({"n": 5})),
    ];

    let summary = run_session(&daemon, &descriptor, &cases, false, Span::none()).expect("run");
    assert_eq!(summary.outcomes.len(), 3);
    assert!(summary.outcomes[0].passed());
    assert!(summary.outcomes[1].passed());
    assert!(!summary.outcomes[2].passed());
    assert_eq!(daemon.session_count(), 0);
}

#[test]
fn session_runner_tears_down_when_an_execution_fails() {
    let dir = tempdir().expect("tempdir");
    let daemon = TestDaemon::new(DaemonConfig::new(engine_config(dir.path())), Span::none());
    let descriptor = PipelineDescriptor::new(
        PipelineSpec::new("main").with_config(filter_config(dir.path(), "main.conf", "main-id")),
    )
    .with_slots(1);

    let cases = vec![
        TestCase::new("uses the only slot")
            .with_input(r#"{"n":1}"#)
            .expecting(json!({"n": 1})),
        TestCase::new("has no slot").with_input(r#"{"n":2}"#),
    ];

    let err = run_session(&daemon, &descriptor, &cases, false, Span::none())
        .expect_err("second case cannot run");
    assert!(err.to_string().contains("stream slots"));
    assert_eq!(daemon.session_count(), 0);
}
