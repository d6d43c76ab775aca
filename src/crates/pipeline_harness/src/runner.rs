use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn, Span};

use crate::config::EngineConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::PipelineDescriptor;
use crate::postprocess::{post_process, Event};
use crate::process::EngineProcess;
use crate::session::{Control, ExecuteTestRequest, SessionId, SetupTestRequest, TeardownTestRequest};
use crate::stream::StreamChannel;
use crate::synth::FieldSet;

fn default_codec() -> String {
    "line".to_string()
}

/// Input and expected output of one logical test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub name: String,
    /// Codec the engine decodes the input lines with (standalone mode only).
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Fields added to every input event.
    #[serde(default)]
    pub fields: FieldSet,
    #[serde(default)]
    pub input_lines: Vec<String>,
    /// Events the filters should emit, in order.
    #[serde(default)]
    pub expected: Vec<Value>,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            codec: default_codec(),
            fields: FieldSet::new(),
            input_lines: Vec::new(),
            expected: Vec::new(),
        }
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn with_fields(mut self, fields: FieldSet) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_input(mut self, line: impl Into<String>) -> Self {
        self.input_lines.push(line.into());
        self
    }

    pub fn expecting(mut self, event: Value) -> Self {
        self.expected.push(event);
        self
    }

    /// Load a test case from a JSON file, naming it after the file if unnamed.
    pub fn from_json_file(path: &Path) -> HarnessResult<Self> {
        let text = fs::read_to_string(path)?;
        let mut case: TestCase = serde_json::from_str(&text)?;
        if case.name.is_empty() {
            case.name = path.display().to_string();
        }
        Ok(case)
    }

    /// Compare cleaned events against the expectation.
    pub fn compare(&self, events: Vec<Event>) -> CaseOutcome {
        let actual: Vec<Value> = events.into_iter().map(Event::into_value).collect();
        let status = if actual == self.expected {
            CaseStatus::Passed
        } else {
            CaseStatus::Mismatch {
                expected: self.expected.clone(),
                actual,
            }
        };
        CaseOutcome {
            name: self.name.clone(),
            status,
        }
    }

    fn errored(&self, message: impl Into<String>) -> CaseOutcome {
        CaseOutcome {
            name: self.name.clone(),
            status: CaseStatus::Error(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseStatus {
    Passed,
    Mismatch {
        expected: Vec<Value>,
        actual: Vec<Value>,
    },
    /// The case's results could not be collected or parsed.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseOutcome {
    pub name: String,
    pub status: CaseStatus,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        self.status == CaseStatus::Passed
    }
}

/// Per-case outcomes of a run. Failing cases never abort the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub outcomes: Vec<CaseOutcome>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(CaseOutcome::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.passed())
    }
}

/// Run every case through a single engine process, one stream per case.
pub fn run_standalone(
    config: &EngineConfig,
    cases: &[TestCase],
    debug: bool,
    span: Span,
) -> HarnessResult<RunSummary> {
    let mut streams = Vec::with_capacity(cases.len());
    for case in cases {
        streams.push(StreamChannel::create(
            case.codec.as_str(),
            case.fields.clone(),
            config.write_timeout,
            span.clone(),
        )?);
    }

    let mut process = EngineProcess::prepare(config, streams, span.clone())?;
    process.start()?;

    let mut feed_errors = Vec::with_capacity(cases.len());
    for (index, case) in cases.iter().enumerate() {
        let stream = process
            .stream_mut(index)
            .ok_or_else(|| HarnessError::config(format!("no stream for case {}", case.name)))?;
        let fed = feed(stream, &case.input_lines);
        if let Err(err) = stream.close() {
            warn!(parent: &span, case = %case.name, error = %err, "closing case stream failed");
        }
        feed_errors.push(fed.err().map(|err| err.to_string()));
    }

    let result = process.wait()?;
    process.release();

    let mut summary = RunSummary::default();
    for (index, case) in cases.iter().enumerate() {
        let drain_error = result
            .drain_errors
            .iter()
            .find(|error| error.stream == index)
            .map(|error| error.message.clone());
        let outcome = match feed_errors[index].clone().or(drain_error) {
            Some(message) => case.errored(message),
            None => {
                let lines = result.events.get(index).map(Vec::as_slice).unwrap_or_default();
                match post_process(lines, debug) {
                    Ok(events) => case.compare(events),
                    Err(err) => case.errored(err.to_string()),
                }
            }
        };
        record(&span, &outcome);
        summary.outcomes.push(outcome);
    }
    Ok(summary)
}

fn feed(stream: &mut StreamChannel, lines: &[String]) -> HarnessResult<()> {
    for line in lines {
        stream.write_line(line)?;
    }
    Ok(())
}

/// Run every case through a daemon session. The session is torn down even
/// when an execution fails.
pub fn run_session(
    control: &dyn Control,
    descriptor: &PipelineDescriptor,
    cases: &[TestCase],
    debug: bool,
    span: Span,
) -> HarnessResult<RunSummary> {
    descriptor.validate()?;
    let setup = control.setup_test(SetupTestRequest {
        pipeline: descriptor.to_bytes()?,
    })?;

    let summary = execute_cases(control, &setup.session_id, cases, debug, &span);
    let teardown = control.teardown_test(TeardownTestRequest {
        session_id: setup.session_id,
        stats: false,
    });

    let summary = summary?;
    teardown?;
    Ok(summary)
}

fn execute_cases(
    control: &dyn Control,
    session_id: &SessionId,
    cases: &[TestCase],
    debug: bool,
    span: &Span,
) -> HarnessResult<RunSummary> {
    let mut summary = RunSummary::default();
    for case in cases {
        let fields = if case.fields.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&case.fields)?
        };
        let response = control.execute_test(ExecuteTestRequest {
            session_id: session_id.clone(),
            input_lines: case.input_lines.clone(),
            fields,
            expected_events: Some(case.expected.len()),
        })?;

        let outcome = match post_process(&response.results, debug) {
            Ok(events) => case.compare(events),
            Err(err) => case.errored(err.to_string()),
        };
        record(span, &outcome);
        summary.outcomes.push(outcome);
    }
    Ok(summary)
}

fn record(span: &Span, outcome: &CaseOutcome) {
    match &outcome.status {
        CaseStatus::Passed => info!(parent: span, case = %outcome.name, "test case passed"),
        CaseStatus::Mismatch { .. } => {
            warn!(parent: span, case = %outcome.name, "test case failed, continuing with the rest")
        }
        CaseStatus::Error(message) => {
            warn!(parent: span, case = %outcome.name, error = %message, "test case errored")
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn compare_reports_mismatch_with_both_sides() {
        let case = TestCase::new("greeting").expecting(json!({"message": "hello"}));
        let event = Event::parse(r#"{"message":"bye"}"#).expect("event");

        let outcome = case.compare(vec![event]);
        assert!(!outcome.passed());
        assert_eq!(
            outcome.status,
            CaseStatus::Mismatch {
                expected: vec![json!({"message": "hello"})],
                actual: vec![json!({"message": "bye"})],
            }
        );
    }

    #[test]
    fn summary_fails_if_any_case_fails() {
        let passing = TestCase::new("ok").compare(Vec::new());
        let failing = TestCase::new("bad").expecting(json!({})).compare(Vec::new());
        let summary = RunSummary {
            outcomes: vec![passing, failing],
        };
        assert!(!summary.success());
        assert_eq!(summary.failures().count(), 1);
        assert!(RunSummary::default().success());
    }

    #[test]
    fn test_case_file_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("case.json");
        fs::write(&path, r#"{"input_lines": ["x"], "expected": [{"message": "x"}]}"#)
            .expect("write");

        let case = TestCase::from_json_file(&path).expect("load");
        assert_eq!(case.codec, "line");
        assert_eq!(case.name, path.display().to_string());
        assert_eq!(case.input_lines, vec!["x".to_string()]);
    }
}
