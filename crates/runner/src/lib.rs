//! Operation execution engine.
//!
//! Turns an [`OperationDef`](opexec_core::OperationDef) plus user-supplied
//! parameter values into a supervised child process whose combined output is
//! mirrored live and captured to a time-indexed log.
//!
//! The pipeline is: [`params::resolve`] → [`CommandBuilder::build`] →
//! [`Command::expand`] → spawn → [`OutputCapture`] and [`ProcessSupervisor`]
//! running side by side. [`OperationExecutor`] drives the whole sequence.

pub mod assign;
pub mod capture;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod index;
pub mod params;
pub mod publisher;
pub mod run_dir;
pub mod supervisor;

pub use assign::{format_assigns, parse_assigns};
pub use capture::{OutputCallback, OutputCapture};
pub use command::{CmdFlag, Command, CommandBuilder, RunAttrs};
pub use config::RunnerConfig;
pub use error::{CaptureError, ProcessError, Result, RunnerError};
pub use executor::{OperationExecutor, RunOptions, RunOutcome};
pub use index::{read_index, read_output, OutputLine};
pub use params::resolve;
pub use publisher::LinePublisher;
pub use run_dir::RunDir;
pub use supervisor::{Ending, ProcessHandle, ProcessSupervisor, Supervision};
