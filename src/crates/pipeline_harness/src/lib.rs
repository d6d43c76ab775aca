//! Utilities for driving an event-processing engine in tests: feeding input
//! lines to it over per-test Unix sockets, collecting what its filters emit,
//! and comparing that with what each test expects.
//!
//! Typical usage:
//! ```no_run
//! use pipeline_harness::{run_standalone, EngineConfig, TestCase};
//! use serde_json::json;
//!
//! let config = EngineConfig::new("/usr/share/logstash/bin/logstash")
//!     .with_config_source("/etc/logstash/conf.d")
//!     .keep_env_var("JAVA_HOME");
//! let case = TestCase::new("syslog")
//!     .with_input("<13>Oct 17 10:00:00 host app: hello")
//!     .expecting(json!({"program": "app", "message": "hello"}));
//!
//! let summary = run_standalone(&config, &[case], false, tracing::Span::current())
//!     .expect("engine should run");
//! for failure in summary.failures() {
//!     println!("{} failed: {:?}", failure.name, failure.status);
//! }
//! ```
//!
//! Long-lived engines are driven through [`TestDaemon`] and the [`Control`]
//! operations instead, so several executions share one engine start-up.

mod config;
mod error;
mod pipeline;
mod postprocess;
mod process;
mod runner;
mod session;
mod stream;
mod synth;

pub use config::{DaemonConfig, EngineConfig};
pub use error::{HarnessError, HarnessResult};
pub use pipeline::{PipelineDescriptor, PipelineSpec};
pub use postprocess::{post_process, Event};
pub use process::{
    engine_args, is_benign_shutdown_race, limited_environment, DrainError, EngineProcess,
    ExitOutcome, LogLine, LogStream, ProcessResult, ProcessState,
};
pub use runner::{run_session, run_standalone, CaseOutcome, CaseStatus, RunSummary, TestCase};
pub use session::{
    Control, ExecuteTestRequest, ExecuteTestResponse, SessionId, SessionStats, SetupTestRequest,
    SetupTestResponse, TeardownTestRequest, TeardownTestResponse, TestDaemon,
};
pub use stream::{release_streams, StreamChannel};
pub use synth::{
    input_clause, output_clause, render_hash, stream_tag, synthesize, FieldSet, StreamWiring,
    SynthesizedConfig, RESERVED_PREFIX, SEQUENCE_FIELD, SEQUENCE_FILTER, SEQUENCE_FILTER_FILE,
    STREAM_METADATA_KEY,
};
