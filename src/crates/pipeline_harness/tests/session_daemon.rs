#![cfg(feature = "test-support")]

#[path = "harness_support.rs"]
mod support;

use std::path::Path;
use std::time::Duration;

use pipeline_harness::{
    Control, DaemonConfig, ExecuteTestRequest, HarnessError, PipelineDescriptor, PipelineSpec,
    SessionId, SetupTestRequest, TeardownTestRequest, TestDaemon,
};
use serde_json::json;
use tempfile::tempdir;
use tracing::Span;

use support::{cleaned, engine_config, filter_config};

fn daemon(dir: &Path) -> TestDaemon {
    let config = DaemonConfig::new(engine_config(dir))
        .with_settle_interval(Duration::from_millis(500))
        .with_result_timeout(Duration::from_secs(10))
        .with_shutdown_grace(Duration::from_secs(5));
    TestDaemon::new(config, Span::none())
}

fn setup(daemon: &TestDaemon, dir: &Path, slots: usize) -> SessionId {
    let descriptor = PipelineDescriptor::new(
        PipelineSpec::new("main").with_config(filter_config(dir, "main.conf", "main-mutate")),
    )
    .with_slots(slots);
    daemon
        .setup_test(SetupTestRequest {
            pipeline: descriptor.to_bytes().expect("encode"),
        })
        .expect("setup should start the engine")
        .session_id
}

fn execute(
    daemon: &TestDaemon,
    session_id: &SessionId,
    lines: &[&str],
    fields: serde_json::Value,
    expected_events: Option<usize>,
) -> Result<Vec<String>, HarnessError> {
    daemon
        .execute_test(ExecuteTestRequest {
            session_id: session_id.clone(),
            input_lines: lines.iter().map(|line| line.to_string()).collect(),
            fields: if fields.is_null() {
                Vec::new()
            } else {
                serde_json::to_vec(&fields).expect("fields")
            },
            expected_events,
        })
        .map(|response| response.results)
}

#[test]
fn executions_share_one_engine_and_stay_isolated() {
    let dir = tempdir().expect("tempdir");
    let daemon = daemon(dir.path());
    let session_id = setup(&daemon, dir.path(), 3);
    assert!(session_id.as_str().starts_with("session-"));
    assert_eq!(daemon.session_count(), 1);

    let first = execute(
        &daemon,
        &session_id,
        &[r#"{"message":"one"}"#, r#"{"message":"two"}"#],
        serde_json::Value::Null,
        Some(2),
    )
    .expect("first execution");
    assert_eq!(
        cleaned(&first),
        vec![json!({"message": "one"}), json!({"message": "two"})]
    );

    // No expected count: results are collected once the sink settles.
    let second = execute(
        &daemon,
        &session_id,
        &[r#"{"message":"three"}"#],
        json!({"env": "test"}),
        None,
    )
    .expect("second execution");
    assert_eq!(
        cleaned(&second),
        vec![json!({"message": "three", "env": "test"})]
    );

    let stats = daemon
        .teardown_test(TeardownTestRequest {
            session_id: session_id.clone(),
            stats: true,
        })
        .expect("teardown")
        .stats
        .expect("stats requested");
    assert_eq!(stats.executions, 2);
    assert_eq!(stats.events, 3);
    assert_eq!(stats.slots_used, 2);
    assert_eq!(stats.slots_total, 3);
    assert_eq!(daemon.session_count(), 0);

    let err = execute(&daemon, &session_id, &["{}"], serde_json::Value::Null, Some(1))
        .expect_err("session is gone");
    assert!(matches!(err, HarnessError::UnknownSession(_)));
}

#[test]
fn session_runs_out_of_slots() {
    let dir = tempdir().expect("tempdir");
    let daemon = daemon(dir.path());
    let session_id = setup(&daemon, dir.path(), 1);

    execute(&daemon, &session_id, &[r#"{"a":1}"#], serde_json::Value::Null, Some(1))
        .expect("first execution");
    let err = execute(&daemon, &session_id, &[r#"{"a":2}"#], serde_json::Value::Null, Some(1))
        .expect_err("no slot left");
    assert!(matches!(err, HarnessError::SessionExhausted(1)));

    let response = daemon
        .teardown_test(TeardownTestRequest {
            session_id,
            stats: false,
        })
        .expect("teardown");
    assert!(response.stats.is_none());
}

#[test]
fn invalid_fields_leave_the_slot_unused() {
    let dir = tempdir().expect("tempdir");
    let daemon = daemon(dir.path());
    let session_id = setup(&daemon, dir.path(), 1);

    let err = execute(&daemon, &session_id, &["{}"], json!(["not", "an", "object"]), Some(1))
        .expect_err("fields must be an object");
    assert!(matches!(err, HarnessError::InvalidRequest(_)));

    let results = execute(&daemon, &session_id, &[r#"{"ok":true}"#], serde_json::Value::Null, Some(1))
        .expect("slot still available");
    assert_eq!(cleaned(&results), vec![json!({"ok": true})]);

    daemon
        .teardown_test(TeardownTestRequest {
            session_id,
            stats: false,
        })
        .expect("teardown");
}

#[test]
fn separate_sessions_run_side_by_side() {
    let dir = tempdir().expect("tempdir");
    let other = tempdir().expect("tempdir");
    let daemon = daemon(dir.path());
    let first = setup(&daemon, dir.path(), 1);
    let second = setup(&daemon, other.path(), 1);
    assert_ne!(first, second);
    assert_eq!(daemon.session_count(), 2);

    let results = execute(&daemon, &second, &[r#"{"from":"second"}"#], serde_json::Value::Null, Some(1))
        .expect("second session");
    assert_eq!(cleaned(&results), vec![json!({"from": "second"})]);
    let results = execute(&daemon, &first, &[r#"{"from":"first"}"#], serde_json::Value::Null, Some(1))
        .expect("first session");
    assert_eq!(cleaned(&results), vec![json!({"from": "first"})]);

    for session_id in [first, second] {
        daemon
            .teardown_test(TeardownTestRequest {
                session_id,
                stats: false,
            })
            .expect("teardown");
    }
}

#[test]
fn expected_count_is_a_floor_not_a_cap() {
    let dir = tempdir().expect("tempdir");
    let daemon = daemon(dir.path());
    let session_id = setup(&daemon, dir.path(), 2);

    let results = execute(
        &daemon,
        &session_id,
        &[r#"{"n":1}"#, r#"{"n":2}"#],
        serde_json::Value::Null,
        Some(1),
    )
    .expect("surplus events");
    assert_eq!(cleaned(&results), vec![json!({"n": 1}), json!({"n": 2})]);

    let results = execute(
        &daemon,
        &session_id,
        &[r#"{"kept":true}"#],
        serde_json::Value::Null,
        Some(0),
    )
    .expect("nothing expected");
    assert_eq!(cleaned(&results), vec![json!({"kept": true})]);

    daemon
        .teardown_test(TeardownTestRequest {
            session_id,
            stats: false,
        })
        .expect("teardown");
}
