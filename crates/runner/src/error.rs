use opexec_core::ParameterError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error("invalid assignment(s) {}: expected NAME=VALUE", .0.join(", "))]
    InvalidAssign(Vec<String>),

    #[error("invalid definition for {operation}: {reason}")]
    InvalidDefinition { operation: String, reason: String },

    #[error("Output capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RunnerError {
    pub fn invalid_definition(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// True for errors a caller can fix by changing its parameter input.
    pub fn is_parameter_error(&self) -> bool {
        matches!(self, Self::Parameter(_) | Self::InvalidAssign(_))
    }
}

impl From<serde_json::Error> for RunnerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("output capture already opened")]
    AlreadyOpen,

    #[error("output capture not open")]
    NotOpen,

    #[error("process stdout must be piped")]
    StdoutNotPiped,

    #[error("timed out after {0:?} waiting for the output lock")]
    CloseTimeout(Duration),

    #[error("output readers still running; wait for them before closing")]
    ReadersRunning,

    #[error("output reader failed: {0}")]
    ReaderFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Process did not terminate (pid {pid})")]
    Stuck { pid: u32 },

    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
