//! Command-line front end: runs JSON test case files through the engine and
//! reports which ones produced unexpected events.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use pipeline_harness::{
    run_session, run_standalone, CaseStatus, DaemonConfig, EngineConfig, HarnessError,
    PipelineDescriptor, PipelineSpec, RunSummary, TestCase, TestDaemon,
};
use tracing::info_span;
use tracing_subscriber::EnvFilter;

/// Verify pipeline filters against recorded test cases.
#[derive(Parser)]
#[command(name = "pipeline-harness")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine executable to run.
    #[arg(long)]
    engine_path: PathBuf,

    /// Ambient environment variable passed through to the engine.
    #[arg(long = "keep-env", value_name = "VAR")]
    keep_env: Vec<String>,

    /// Keep harness-injected fields and tags in the reported events.
    #[arg(long)]
    debug: bool,

    /// Run the cases through one long-lived engine session instead of a
    /// single engine run.
    #[arg(long)]
    session: bool,

    /// Codec used for input lines in session mode.
    #[arg(long, default_value = "json_lines")]
    codec: String,

    /// Harness log filter, e.g. `info` or `pipeline_harness=debug`.
    /// Overrides `RUST_LOG`; defaults to `warn` when neither is set.
    #[arg(long)]
    log_level: Option<String>,

    /// Test case files.
    #[arg(required = true)]
    cases: Vec<PathBuf>,

    /// Pipeline config files or directories.
    #[arg(last = true, required = true)]
    config: Vec<PathBuf>,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let cases = cli
        .cases
        .iter()
        .map(|path| {
            TestCase::from_json_file(path)
                .with_context(|| format!("loading test case {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut engine = cli
        .config
        .iter()
        .fold(EngineConfig::new(&cli.engine_path), |config, source| {
            config.with_config_source(source)
        });
    for var in &cli.keep_env {
        engine = engine.keep_env_var(var);
    }

    let span = info_span!("pipeline_harness", cases = cases.len());
    let outcome = if cli.session {
        let pipeline = cli
            .config
            .iter()
            .fold(PipelineSpec::new("main"), |pipeline, source| {
                pipeline.with_config(source)
            });
        let descriptor = PipelineDescriptor::new(pipeline)
            .with_codec(&cli.codec)
            .with_slots(cases.len().max(1));
        let daemon = TestDaemon::new(DaemonConfig::new(engine), span.clone());
        run_session(&daemon, &descriptor, &cases, cli.debug, span)
    } else {
        run_standalone(&engine, &cases, cli.debug, span)
    };

    let summary = match outcome {
        Ok(summary) => summary,
        Err(err) => {
            if let HarnessError::EngineExited { log, output, .. } = &err {
                eprintln!("engine log:\n{log}");
                eprintln!("engine output:\n{output}");
            }
            return Err(err).context("running test cases");
        }
    };

    report(&summary)?;
    Ok(if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn report(summary: &RunSummary) -> anyhow::Result<()> {
    for outcome in &summary.outcomes {
        match &outcome.status {
            CaseStatus::Passed => println!("PASS {}", outcome.name),
            CaseStatus::Mismatch { expected, actual } => {
                println!("FAIL {}", outcome.name);
                println!("expected:\n{}", serde_json::to_string_pretty(expected)?);
                println!("actual:\n{}", serde_json::to_string_pretty(actual)?);
            }
            CaseStatus::Error(message) => println!("ERROR {}: {message}", outcome.name),
        }
    }
    let failed = summary.failures().count();
    println!(
        "{} passed, {failed} failed",
        summary.outcomes.len() - failed
    );
    Ok(())
}
