use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn, Span};

use crate::config::EngineConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::stream::{release_streams, StreamChannel};
use crate::synth::{self, SynthesizedConfig, SEQUENCE_FILTER, SEQUENCE_FILTER_FILE};

/// The unix input can raise an IOError on a closed stream while the engine
/// shuts down, after every event has already been written. Exits whose log
/// matches this are treated as successful; nothing else is.
static BENIGN_SHUTDOWN_RACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"An unexpected error occurred.*closed stream.*IOError")
        .expect("benign shutdown pattern is valid")
});

/// Origin stream for captured output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Single captured output line with its source.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

/// How a finished engine run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Failed with the known shutdown race and was accepted anyway.
    Recovered,
    Failure,
}

/// Lifecycle of an [`EngineProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Prepared,
    Running,
    Exited(ExitOutcome),
    Released,
}

/// A stream whose sink could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainError {
    pub stream: usize,
    pub message: String,
}

/// Everything collected from one engine run.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Raw event lines per stream, in stream order.
    pub events: Vec<Vec<String>>,
    /// Contents of the engine's own log file.
    pub log: String,
    /// Captured standard output and error of the engine process.
    pub output: String,
    pub success: bool,
    pub drain_errors: Vec<DrainError>,
}

/// One engine child process wired to a set of stream channels.
///
/// The process owns its streams, its log file and its config directory and
/// releases all of them exactly once, whichever state it ends up in.
pub struct EngineProcess {
    span: Span,
    streams: Vec<StreamChannel>,
    command: Command,
    child: Option<Child>,
    config_dir: Option<TempDir>,
    log_file: Option<NamedTempFile>,
    output_buffer: Arc<Mutex<Vec<LogLine>>>,
    readers: Vec<thread::JoinHandle<()>>,
    state: ProcessState,
}

impl EngineProcess {
    /// Synthesize the wiring for `streams` and get ready to spawn the engine.
    ///
    /// On failure every stream handed in is released before returning.
    pub fn prepare(
        config: &EngineConfig,
        mut streams: Vec<StreamChannel>,
        span: Span,
    ) -> HarnessResult<Self> {
        let (command, config_dir, log_file) = match assemble(config, &streams) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(parent: &span, error = %err, "engine preparation failed");
                release_streams(&mut streams);
                return Err(err);
            }
        };

        debug!(
            parent: &span,
            streams = streams.len(),
            config_dir = %config_dir.path().display(),
            "engine prepared"
        );

        Ok(Self {
            span,
            streams,
            command,
            child: None,
            config_dir: Some(config_dir),
            log_file: Some(log_file),
            output_buffer: Arc::new(Mutex::new(Vec::new())),
            readers: Vec::new(),
            state: ProcessState::Prepared,
        })
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// OS process id once the engine has been started.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn streams(&self) -> &[StreamChannel] {
        &self.streams
    }

    pub fn stream_mut(&mut self, index: usize) -> Option<&mut StreamChannel> {
        self.streams.get_mut(index)
    }

    /// Arguments the engine is (or will be) invoked with.
    pub fn args(&self) -> Vec<OsString> {
        self.command.get_args().map(ToOwned::to_owned).collect()
    }

    pub fn config_dir(&self) -> Option<&Path> {
        self.config_dir.as_ref().map(TempDir::path)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_file.as_ref().map(NamedTempFile::path)
    }

    /// Spawn the engine with the prepared configuration.
    pub fn start(&mut self) -> HarnessResult<()> {
        if self.state != ProcessState::Prepared {
            return Err(HarnessError::engine_start(format!(
                "engine cannot be started from state {:?}",
                self.state
            )));
        }

        info!(
            parent: &self.span,
            binary = %self.command.get_program().to_string_lossy(),
            args = ?self.args(),
            "starting engine"
        );
        let mut child = self
            .command
            .spawn()
            .map_err(|err| HarnessError::engine_start(err.to_string()))?;

        // Early startup failures land on stdout/stderr rather than in the log file.
        if let Some(stdout) = child.stdout.take() {
            self.readers.push(spawn_log_reader(
                stdout,
                LogStream::Stdout,
                self.output_buffer.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(spawn_log_reader(
                stderr,
                LogStream::Stderr,
                self.output_buffer.clone(),
            ));
        }

        debug!(parent: &self.span, pid = child.id(), "engine started");
        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Block until the engine exits, then collect its log, output and events.
    ///
    /// A failed exit is only accepted when its log shows the known shutdown
    /// race; otherwise the failure is returned with the captured diagnostics.
    /// Sinks that cannot be read mark the result unsuccessful without stopping
    /// the remaining streams from being drained.
    pub fn wait(&mut self) -> HarnessResult<ProcessResult> {
        let span = self.span.clone();
        let child = match (self.state, self.child.as_mut()) {
            (ProcessState::Running, Some(child)) => child,
            _ => return Err(HarnessError::NotStarted),
        };
        debug!(parent: &span, pid = child.id(), "waiting for engine to terminate");
        let status = child.wait()?;
        self.join_readers();

        let log = self.read_log();
        let output = self.captured_output();

        let outcome = if status.success() {
            ExitOutcome::Success
        } else if is_benign_shutdown_race(&log) {
            warn!(
                parent: &span,
                %status,
                "engine raised the closed-stream IOError on shutdown, processing results anyway"
            );
            ExitOutcome::Recovered
        } else {
            warn!(parent: &span, %status, "engine failed");
            self.state = ProcessState::Exited(ExitOutcome::Failure);
            return Err(HarnessError::EngineExited {
                status,
                log,
                output,
            });
        };

        let mut result = ProcessResult {
            events: Vec::with_capacity(self.streams.len()),
            log,
            output,
            success: true,
            drain_errors: Vec::new(),
        };
        for (index, stream) in self.streams.iter_mut().enumerate() {
            match stream.read_events() {
                Ok(lines) => result.events.push(lines),
                Err(err) => {
                    warn!(parent: &span, stream = index, error = %err, "failed to drain stream");
                    result.events.push(Vec::new());
                    result.success = false;
                    result.drain_errors.push(DrainError {
                        stream: index,
                        message: err.to_string(),
                    });
                }
            }
            stream.close_sink();
        }

        self.state = ProcessState::Exited(outcome);
        Ok(result)
    }

    /// Close every stream and give the engine `grace` to exit before killing it.
    pub fn shutdown(&mut self, grace: Duration) -> HarnessResult<Option<ExitStatus>> {
        let span = self.span.clone();
        for stream in &mut self.streams {
            if let Err(err) = stream.close() {
                debug!(parent: &span, error = %err, "closing stream during shutdown failed");
            }
        }

        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };

        let start = Instant::now();
        let mut exited = None;
        while start.elapsed() < grace {
            if let Some(status) = child.try_wait()? {
                exited = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let status = match exited {
            Some(status) => status,
            None => {
                warn!(parent: &span, pid = child.id(), ?grace, "engine did not exit in time, killing it");
                // Force terminate if graceful shutdown did not complete.
                let _ = child.kill();
                child.wait()?
            }
        };
        self.join_readers();

        let outcome = if status.success() {
            ExitOutcome::Success
        } else if is_benign_shutdown_race(&self.read_log()) {
            ExitOutcome::Recovered
        } else {
            ExitOutcome::Failure
        };
        if self.state == ProcessState::Running {
            self.state = ProcessState::Exited(outcome);
        }
        Ok(Some(status))
    }

    /// Release streams, log file and config directory. Repeat calls are no-ops.
    pub fn release(&mut self) {
        let span = self.span.clone();
        if self.state == ProcessState::Released {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            if let Ok(None) = child.try_wait() {
                warn!(parent: &span, pid = child.id(), "engine still running at release, killing it");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        self.join_readers();
        release_streams(&mut self.streams);

        if let Some(log_file) = self.log_file.take() {
            if let Err(err) = log_file.close() {
                debug!(parent: &span, error = %err, "engine log file already gone");
            }
        }
        if let Some(dir) = self.config_dir.take() {
            if let Err(err) = dir.close() {
                warn!(parent: &span, error = %err, "failed to remove engine config directory");
            }
        }
        self.state = ProcessState::Released;
    }

    fn join_readers(&mut self) {
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
    }

    fn read_log(&mut self) -> String {
        let span = self.span.clone();
        let Some(log_file) = self.log_file.as_mut() else {
            return String::new();
        };
        let file = log_file.as_file_mut();
        let mut text = String::new();
        if let Err(err) = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut text))
        {
            // Only matters when the engine failed, which is reported anyway.
            warn!(parent: &span, error = %err, "failed to read engine log file");
        }
        text
    }

    fn captured_output(&self) -> String {
        match self.output_buffer.lock() {
            Ok(buffer) => buffer
                .iter()
                .map(|line| line.line.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            Err(_) => String::new(),
        }
    }

    /// Captured stdout/stderr lines so far.
    pub fn output_lines(&self) -> Vec<LogLine> {
        self.output_buffer
            .lock()
            .map(|buffer| buffer.clone())
            .unwrap_or_default()
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.release();
    }
}

/// Whether an engine log shows the known, harmless shutdown race.
pub fn is_benign_shutdown_race(log: &str) -> bool {
    BENIGN_SHUTDOWN_RACE.is_match(log)
}

/// Keep only the ambient variables named in `kept`.
pub fn limited_environment(
    ambient: impl IntoIterator<Item = (String, String)>,
    kept: &[String],
) -> Vec<(String, String)> {
    ambient
        .into_iter()
        .filter(|(name, _)| kept.iter().any(|keep| keep == name))
        .collect()
}

/// Engine command line for the synthesized wiring.
pub fn engine_args(
    synthesized: &SynthesizedConfig,
    config_dir: &Path,
    log_path: &Path,
) -> Vec<OsString> {
    vec![
        // A single worker keeps events of one stream in input order.
        "-w".into(),
        "1".into(),
        "--debug".into(),
        "-e".into(),
        synthesized.pipeline_text().into(),
        "--config".into(),
        config_dir.as_os_str().to_owned(),
        "--log".into(),
        log_path.as_os_str().to_owned(),
    ]
}

fn assemble(
    config: &EngineConfig,
    streams: &[StreamChannel],
) -> HarnessResult<(Command, TempDir, NamedTempFile)> {
    if config.config_sources.is_empty() {
        return Err(HarnessError::config(
            "must provide at least one configuration file or directory",
        ));
    }

    let wiring: Vec<_> = streams.iter().map(StreamChannel::wiring).collect();
    let synthesized = synth::synthesize(&wiring)?;

    let log_file = tempfile::Builder::new()
        .prefix("lfv-engine-")
        .suffix(".log")
        .tempfile()
        .map_err(|err| HarnessError::allocation("engine log file", err))?;
    let config_dir = materialize_config_dir(&config.config_sources)?;

    let ambient = std::env::vars_os()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)));

    let mut command = Command::new(&config.binary_path);
    command
        .args(engine_args(&synthesized, config_dir.path(), log_file.path()))
        .args(&config.extra_args)
        .env_clear()
        .envs(limited_environment(ambient, &config.kept_env_vars))
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &config.working_directory {
        command.current_dir(dir);
    }

    Ok((command, config_dir, log_file))
}

/// Copy every config source into one private directory and add the sequence filter.
fn materialize_config_dir(sources: &[PathBuf]) -> HarnessResult<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("lfv-config-")
        .tempdir()
        .map_err(|err| HarnessError::allocation("engine config directory", err))?;

    let mut seen = BTreeSet::new();
    let mut add = |source: &Path| -> HarnessResult<()> {
        let name = source
            .file_name()
            .ok_or_else(|| HarnessError::config(format!("{} has no file name", source.display())))?
            .to_owned();
        if !seen.insert(name.clone()) {
            return Err(HarnessError::config(format!(
                "config file name {} is used more than once",
                name.to_string_lossy()
            )));
        }
        fs::copy(source, dir.path().join(&name)).map_err(|err| {
            HarnessError::config(format!("cannot copy {}: {err}", source.display()))
        })?;
        Ok(())
    };

    for source in sources {
        let metadata = fs::metadata(source).map_err(|err| {
            HarnessError::config(format!("cannot read config source {}: {err}", source.display()))
        })?;
        if metadata.is_dir() {
            let mut files = Vec::new();
            for entry in fs::read_dir(source)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    files.push(entry.path());
                }
            }
            files.sort();
            for file in files {
                add(&file)?;
            }
        } else {
            add(source)?;
        }
    }

    if seen.contains(std::ffi::OsStr::new(SEQUENCE_FILTER_FILE)) {
        return Err(HarnessError::config(format!(
            "config file name {SEQUENCE_FILTER_FILE} is reserved"
        )));
    }
    fs::write(dir.path().join(SEQUENCE_FILTER_FILE), SEQUENCE_FILTER)
        .map_err(|err| HarnessError::allocation("sequence filter file", err))?;

    Ok(dir)
}

fn spawn_log_reader<R: Read + Send + 'static>(
    reader: R,
    stream: LogStream,
    buffer: Arc<Mutex<Vec<LogLine>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let buf_reader = BufReader::new(reader);
        for line in buf_reader.lines().map_while(Result::ok) {
            if let Ok(mut guard) = buffer.lock() {
                guard.push(LogLine {
                    stream,
                    line: line.trim_end().to_string(),
                });
            }
        }
    })
}
