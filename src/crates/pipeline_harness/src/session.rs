use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Span};
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::PipelineDescriptor;
use crate::process::EngineProcess;
use crate::stream::StreamChannel;
use crate::synth::FieldSet;

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Opaque token handed out by `SetupTest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a new unique session id.
    pub fn generate() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupTestRequest {
    /// Serialized [`PipelineDescriptor`].
    pub pipeline: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupTestResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTestRequest {
    pub session_id: SessionId,
    pub input_lines: Vec<String>,
    /// JSON object merged into every input line; empty for none.
    #[serde(default)]
    pub fields: Vec<u8>,
    /// Stop waiting for results once this many events have arrived.
    #[serde(default)]
    pub expected_events: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTestResponse {
    /// Raw, unordered event lines of this execution.
    pub results: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownTestRequest {
    pub session_id: SessionId,
    /// Whether to return [`SessionStats`].
    pub stats: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownTestResponse {
    pub stats: Option<SessionStats>,
}

/// Counters accumulated over the life of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub executions: usize,
    pub events: usize,
    pub slots_used: usize,
    pub slots_total: usize,
    pub uptime_ms: u64,
}

/// The unary calls a test daemon answers, whatever transport carries them.
pub trait Control {
    fn setup_test(&self, request: SetupTestRequest) -> HarnessResult<SetupTestResponse>;
    fn execute_test(&self, request: ExecuteTestRequest) -> HarnessResult<ExecuteTestResponse>;
    fn teardown_test(&self, request: TeardownTestRequest)
        -> HarnessResult<TeardownTestResponse>;
}

/// A warm engine bound to one caller.
///
/// Every execution claims a stream slot of its own; slots are never reused,
/// so results of one execution cannot leak into another.
struct Session {
    span: Span,
    process: EngineProcess,
    codec: String,
    slots: usize,
    next_slot: usize,
    executions: usize,
    events: usize,
    started: Instant,
}

impl Session {
    fn execute(
        &mut self,
        request: &ExecuteTestRequest,
        config: &DaemonConfig,
    ) -> HarnessResult<Vec<String>> {
        let span = self.span.clone();
        let fields = parse_fields(&request.fields)?;
        let lines = merge_fields(&self.codec, &request.input_lines, &fields)?;

        if self.next_slot >= self.slots {
            return Err(HarnessError::SessionExhausted(self.slots));
        }
        let slot = self.next_slot;
        self.next_slot += 1;

        let stream = self
            .process
            .stream_mut(slot)
            .ok_or(HarnessError::SessionExhausted(self.slots))?;
        for line in &lines {
            stream.write_line(line)?;
        }
        stream.close()?;
        debug!(parent: &span, slot, lines = lines.len(), "input written");

        let results = drain_settled(stream, config, request.expected_events, &span)?;
        self.executions += 1;
        self.events += results.len();
        debug!(parent: &span, slot, events = results.len(), "execution finished");
        Ok(results)
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            executions: self.executions,
            events: self.events,
            slots_used: self.next_slot,
            slots_total: self.slots,
            uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// In-process implementation of [`Control`].
///
/// Each session gets its own engine process. Calls against one session are
/// serialized; calls against different sessions run independently.
pub struct TestDaemon {
    config: DaemonConfig,
    span: Span,
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<Session>>>>,
}

impl TestDaemon {
    pub fn new(config: DaemonConfig, span: Span) -> Self {
        Self {
            config,
            span,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of sessions that have been set up and not torn down.
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn session(&self, id: &SessionId) -> HarnessResult<Arc<Mutex<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| HarnessError::UnknownSession(id.to_string()))
    }
}

impl Control for TestDaemon {
    fn setup_test(&self, request: SetupTestRequest) -> HarnessResult<SetupTestResponse> {
        let descriptor = PipelineDescriptor::from_bytes(&request.pipeline)?;
        descriptor.validate()?;
        let slots = descriptor.slots.unwrap_or(self.config.default_slots);
        if slots == 0 {
            return Err(HarnessError::descriptor("session needs at least one slot"));
        }

        let session_id = SessionId::generate();
        let span = info_span!(parent: &self.span, "session", session = %session_id);

        let mut engine = self.config.engine.clone();
        engine
            .config_sources
            .extend(descriptor.config_sources().cloned());

        let mut streams = Vec::with_capacity(slots);
        for _ in 0..slots {
            streams.push(StreamChannel::create(
                descriptor.codec.as_str(),
                descriptor.fields.clone(),
                engine.write_timeout,
                span.clone(),
            )?);
        }
        let mut process = EngineProcess::prepare(&engine, streams, span.clone())?;
        process.start()?;
        info!(parent: &span, slots, pid = ?process.pid(), "session ready");

        let session = Session {
            span,
            process,
            codec: descriptor.codec,
            slots,
            next_slot: 0,
            executions: 0,
            events: 0,
            started: Instant::now(),
        };
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));

        Ok(SetupTestResponse { session_id })
    }

    fn execute_test(&self, request: ExecuteTestRequest) -> HarnessResult<ExecuteTestResponse> {
        let session = self.session(&request.session_id)?;
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        let results = session.execute(&request, &self.config)?;
        Ok(ExecuteTestResponse { results })
    }

    fn teardown_test(
        &self,
        request: TeardownTestRequest,
    ) -> HarnessResult<TeardownTestResponse> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request.session_id)
            .ok_or_else(|| HarnessError::UnknownSession(request.session_id.to_string()))?;
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);

        let shutdown = session.process.shutdown(self.config.shutdown_grace);
        let stats = request.stats.then(|| session.stats());
        session.process.release();
        let status = shutdown?;
        info!(parent: &session.span, ?status, "session torn down");

        Ok(TeardownTestResponse { stats })
    }
}

fn parse_fields(bytes: &[u8]) -> HarnessResult<FieldSet> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(FieldSet::new());
    }
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(fields) => Ok(fields),
        Value::Null => Ok(FieldSet::new()),
        other => Err(HarnessError::InvalidRequest(format!(
            "fields must be a JSON object, got {other}"
        ))),
    }
}

/// Merge execute-time fields into each line. Only JSON codecs carry
/// structure the harness can add to.
fn merge_fields(codec: &str, lines: &[String], fields: &FieldSet) -> HarnessResult<Vec<String>> {
    if fields.is_empty() {
        return Ok(lines.to_vec());
    }
    if !codec.starts_with("json") {
        return Err(HarnessError::InvalidRequest(format!(
            "input fields need a JSON codec, the session uses {codec}"
        )));
    }

    lines
        .iter()
        .map(|line| match serde_json::from_str::<Value>(line)? {
            Value::Object(mut event) => {
                for (key, value) in fields {
                    event.insert(key.clone(), value.clone());
                }
                Ok(Value::Object(event).to_string())
            }
            _ => Err(HarnessError::InvalidRequest(format!(
                "input line is not a JSON object: {line}"
            ))),
        })
        .collect()
}

/// Wait for a stream's results while the engine keeps running.
///
/// Returns once the sink holds at least `expected` events (any number when
/// unset) and has not grown for one settle interval, so late or surplus
/// events still land in the batch. Gives up after the result timeout and
/// returns what has arrived.
fn drain_settled(
    stream: &mut StreamChannel,
    config: &DaemonConfig,
    expected: Option<usize>,
    span: &Span,
) -> HarnessResult<Vec<String>> {
    let start = Instant::now();
    let mut last_len = stream.sink_len()?;
    let mut last_change = Instant::now();

    loop {
        thread::sleep(DRAIN_POLL);

        let len = stream.sink_len()?;
        if len != last_len {
            last_len = len;
            last_change = Instant::now();
        }

        if last_change.elapsed() >= config.settle_interval {
            let lines = stream.read_events()?;
            if expected.map_or(true, |expected| lines.len() >= expected) {
                return Ok(lines);
            }
        }

        if start.elapsed() >= config.result_timeout {
            warn!(
                parent: span,
                expected = ?expected,
                timeout = ?config.result_timeout,
                "gave up waiting for execution results"
            );
            return stream.read_events();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;

    fn settle_config() -> DaemonConfig {
        DaemonConfig::new(EngineConfig::new("/nonexistent/engine"))
            .with_settle_interval(Duration::from_millis(250))
            .with_result_timeout(Duration::from_secs(5))
    }

    fn append_later(sink: PathBuf, writes: Vec<(u64, &'static str)>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for (delay_ms, line) in writes {
                thread::sleep(Duration::from_millis(delay_ms));
                let mut file = OpenOptions::new().append(true).open(&sink).expect("open sink");
                writeln!(file, "{line}").expect("append");
            }
        })
    }

    #[test]
    fn zero_expected_events_still_waits_for_late_output() {
        let mut stream =
            StreamChannel::create("json_lines", FieldSet::new(), Duration::from_secs(1), Span::none())
                .expect("stream");
        let writer = append_later(stream.sink_path().to_path_buf(), vec![(100, r#"{"dropped":false}"#)]);

        let results =
            drain_settled(&mut stream, &settle_config(), Some(0), &Span::none()).expect("drain");
        writer.join().expect("writer");
        assert_eq!(results, vec![r#"{"dropped":false}"#.to_string()]);
    }

    #[test]
    fn surplus_events_are_not_cut_off() {
        let mut stream =
            StreamChannel::create("json_lines", FieldSet::new(), Duration::from_secs(1), Span::none())
                .expect("stream");
        let writer = append_later(
            stream.sink_path().to_path_buf(),
            vec![(20, r#"{"n":1}"#), (50, r#"{"n":2}"#)],
        );

        let results =
            drain_settled(&mut stream, &settle_config(), Some(1), &Span::none()).expect("drain");
        writer.join().expect("writer");
        assert_eq!(
            results,
            vec![r#"{"n":1}"#.to_string(), r#"{"n":2}"#.to_string()]
        );
    }

    #[test]
    fn session_ids_are_unique_and_prefixed() {
        let first = SessionId::generate();
        let second = SessionId::generate();
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("session-"));
    }

    #[test]
    fn empty_field_bytes_mean_no_fields() {
        assert!(parse_fields(b"").expect("empty").is_empty());
        assert!(parse_fields(b"null").expect("null").is_empty());
        assert!(parse_fields(b"[1]").is_err());
    }

    #[test]
    fn fields_merge_into_json_lines() {
        let fields = match json!({"type": "syslog"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let merged = merge_fields("json_lines", &[r#"{"a":1}"#.to_string()], &fields)
            .expect("merge");
        let value: Value = serde_json::from_str(&merged[0]).expect("json");
        assert_eq!(value, json!({"a": 1, "type": "syslog"}));
    }

    #[test]
    fn fields_need_a_json_codec() {
        let fields = match json!({"type": "syslog"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let err = merge_fields("line", &["plain".to_string()], &fields).expect_err("line codec");
        assert!(matches!(err, HarnessError::InvalidRequest(_)));
        assert_eq!(
            merge_fields("line", &["plain".to_string()], &FieldSet::new()).expect("no fields"),
            vec!["plain".to_string()]
        );
    }
}
