use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Result alias for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that can occur while wiring, spawning or driving the engine process.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to allocate {what}: {source}")]
    ResourceAllocation {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("engine did not connect to the stream within {0:?}")]
    WriteTimeout(Duration),
    #[error("stream has already been closed")]
    StreamClosed,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to spawn engine: {0}")]
    EngineStart(String),
    #[error("engine process has not been started")]
    NotStarted,
    /// The engine exited unsuccessfully; carries everything it said on the way out.
    #[error("engine terminated with status {status}")]
    EngineExited {
        status: ExitStatus,
        log: String,
        output: String,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed event data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("invalid pipeline descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("all {0} stream slots of the session have been used")]
    SessionExhausted(usize),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HarnessError {
    pub(crate) fn allocation(what: &'static str, source: io::Error) -> Self {
        HarnessError::ResourceAllocation { what, source }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        HarnessError::Config(message.into())
    }

    pub(crate) fn engine_start(err: impl Into<String>) -> Self {
        HarnessError::EngineStart(err.into())
    }

    pub(crate) fn descriptor(message: impl Into<String>) -> Self {
        HarnessError::InvalidDescriptor(message.into())
    }
}
