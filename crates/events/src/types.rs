//! Event types published while an operation runs

use chrono::{DateTime, Utc};
use opexec_core::StreamTag;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All possible events for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The child process was spawned
    #[serde(rename = "run.started")]
    RunStarted {
        run_id: Uuid,
        operation: String,
        pid: Option<u32>,
        args: Vec<String>,
    },

    /// A complete line was captured from the child
    #[serde(rename = "run.output")]
    OutputLine {
        run_id: Uuid,
        stream: StreamTag,
        line: String,
    },

    /// The time budget ran out and the process was stopped
    #[serde(rename = "run.timed_out")]
    RunTimedOut { run_id: Uuid, elapsed_secs: f64 },

    /// The child exited and its output was closed
    #[serde(rename = "run.stopped")]
    RunStopped { run_id: Uuid, exit_code: i32 },

    // System events
    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// The run this event belongs to, if any
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::OutputLine { run_id, .. }
            | Event::RunTimedOut { run_id, .. }
            | Event::RunStopped { run_id, .. } => Some(*run_id),
            Event::Error { .. } => None,
        }
    }
}
