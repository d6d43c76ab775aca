use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Process-level configuration for launching the engine binary.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the engine executable to spawn.
    pub binary_path: PathBuf,
    /// Configuration files or directories holding the filters under test.
    pub config_sources: Vec<PathBuf>,
    /// Names of ambient environment variables the child is allowed to see.
    pub kept_env_vars: Vec<String>,
    /// Explicit environment variables applied on top of the kept ones.
    pub env: BTreeMap<String, String>,
    /// Additional CLI arguments appended after the generated ones.
    pub extra_args: Vec<String>,
    /// Optional working directory override for the child process.
    pub working_directory: Option<PathBuf>,
    /// How long a stream write waits for the engine to connect.
    pub write_timeout: Duration,
}

impl EngineConfig {
    /// Create a new config targeting a specific engine binary.
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            config_sources: Vec::new(),
            kept_env_vars: Vec::new(),
            env: BTreeMap::new(),
            extra_args: Vec::new(),
            working_directory: None,
            write_timeout: Duration::from_secs(30),
        }
    }

    /// Add a configuration file or directory.
    pub fn with_config_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_sources.push(path.into());
        self
    }

    /// Let an ambient environment variable through to the child.
    pub fn keep_env_var(mut self, name: impl Into<String>) -> Self {
        self.kept_env_vars.push(name.into());
        self
    }

    /// Add an environment variable override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a passthrough CLI argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Override the working directory for the spawned process.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Override how long stream writes wait for the engine to connect.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// Configuration for the session daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Template for every engine the daemon starts. Config sources come from
    /// the pipeline descriptor of each session and are appended to these.
    pub engine: EngineConfig,
    /// A sink that has not grown for this long is considered drained.
    pub settle_interval: Duration,
    /// Upper bound on how long one execution waits for its results.
    pub result_timeout: Duration,
    /// How long teardown waits for the engine to exit before killing it.
    pub shutdown_grace: Duration,
    /// Stream slots wired per session when the descriptor does not say.
    pub default_slots: usize,
}

impl DaemonConfig {
    /// Daemon settings around `engine` with a 250ms settle interval, a 30s
    /// result timeout, a 5s shutdown grace and 16 default slots.
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            settle_interval: Duration::from_millis(250),
            result_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            default_slots: 16,
        }
    }

    /// Set how long a sink must stay unchanged before its results are returned.
    pub fn with_settle_interval(mut self, interval: Duration) -> Self {
        self.settle_interval = interval;
        self
    }

    /// Set the upper bound on waiting for one execution's results.
    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    /// Set how long teardown waits for the engine before killing it.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the number of stream slots used when a descriptor names none.
    pub fn with_default_slots(mut self, slots: usize) -> Self {
        self.default_slots = slots;
        self
    }
}
