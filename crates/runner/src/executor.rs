//! Runs one operation end to end.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use events::{Event, EventBus};
use opexec_core::{OperationDef, ParamValue, ResolvedParameters};
use tokio::process::Command as ProcessCommand;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::OutputCapture;
use crate::command::CommandBuilder;
use crate::config::RunnerConfig;
use crate::error::{CaptureError, Result, RunnerError};
use crate::params::resolve;
use crate::publisher::LinePublisher;
use crate::run_dir::RunDir;
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip parameter validation.
    pub force: bool,
    /// Don't mirror output to this process's stdout/stderr.
    pub quiet: bool,
    /// Time budget in minutes.
    pub stop_after: Option<f64>,
    /// Overrides the operation's environment.
    pub extra_env: BTreeMap<String, String>,
    /// Where the process runs; a fresh directory under the user data dir
    /// when unset.
    pub run_dir: Option<PathBuf>,
}

impl RunOptions {
    /// Skip parameter validation.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Capture without mirroring to the terminal.
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Stop the process after `minutes`.
    pub fn with_stop_after(mut self, minutes: f64) -> Self {
        self.stop_after = Some(minutes);
        self
    }

    /// Add or override one environment variable.
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(name.into(), value.into());
        self
    }

    /// Run in `dir` instead of a fresh directory.
    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = Some(dir.into());
        self
    }

    fn budget(&self) -> Option<Duration> {
        let minutes = self.stop_after?;
        match Duration::try_from_secs_f64(minutes * 60.0) {
            Ok(budget) => Some(budget),
            Err(_) => {
                warn!(minutes, "Ignoring invalid time budget");
                None
            }
        }
    }
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub exit_code: i32,
    /// The time budget ran out and the process was stopped.
    pub timed_out: bool,
    pub run_dir: PathBuf,
    pub params: ResolvedParameters,
}

/// Resolves, builds, spawns, captures and supervises operations.
#[derive(Debug, Clone, Default)]
pub struct OperationExecutor {
    config: RunnerConfig,
    bus: Option<EventBus>,
}

impl OperationExecutor {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config, bus: None }
    }

    /// Publish run events, including every output line, on `bus`.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.emit(event);
        }
    }

    pub async fn run(
        &self,
        op: &OperationDef,
        user_values: &BTreeMap<String, ParamValue>,
        options: RunOptions,
    ) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let params = resolve(&op.parameters, user_values, options.force)?;
        let (command, attrs) =
            CommandBuilder::from_config(&self.config).build(op, &options.extra_env)?;
        let (args, env) = command.expand(&params, &self.config.interpreter);
        let Some((program, program_args)) = args.split_first() else {
            return Err(RunnerError::invalid_definition(&op.name, "command is empty"));
        };

        let run_dir = RunDir::new(
            options
                .run_dir
                .clone()
                .unwrap_or_else(|| default_run_dir(run_id)),
        );
        run_dir.init().await?;
        run_dir.write_attr("cmd", &args).await?;
        run_dir.write_attr("env", &env).await?;
        run_dir.write_attr("flags", &params).await?;
        for (name, value) in &attrs {
            run_dir.write_attr(name, value).await?;
        }
        run_dir.write_attr("started", &Utc::now()).await?;

        info!(run_id = %run_id, operation = %op.name, "Running {}", args.join(" "));
        let mut child = ProcessCommand::new(program)
            .args(program_args)
            .envs(&env)
            .current_dir(run_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        if let Some(pid) = pid {
            run_dir.write_lock(pid).await?;
        }
        self.emit(Event::RunStarted {
            run_id,
            operation: op.name.clone(),
            pid,
            args: args.clone(),
        });

        let mut capture = OutputCapture::for_run_dir(&run_dir)
            .quiet(options.quiet || self.config.quiet)
            .with_close_timeout(self.config.close_timeout);
        if let Some(bus) = &self.bus {
            capture = capture.with_callback(LinePublisher::new(bus.clone(), run_id));
        }
        if let Err(e) = capture.open(&mut child).await {
            error!(run_id = %run_id, error = %e, "Failed to capture output, stopping process");
            if let Err(kill_error) = child.kill().await {
                warn!(run_id = %run_id, error = %kill_error, "Failed to kill process");
            }
            run_dir.delete_lock().await?;
            return Err(e.into());
        }

        let supervisor = ProcessSupervisor::from_config(&self.config);
        let started = Instant::now();
        let (supervised, captured) = {
            let supervise = supervisor.supervise(&mut child, options.budget());
            let wait = capture.wait();
            tokio::pin!(supervise, wait);

            // Capture can only finish once the pipes close, so a process that
            // survives SIGKILL must not hold up reporting.
            let mut captured = None;
            let supervised = loop {
                tokio::select! {
                    result = &mut supervise => break result,
                    result = &mut wait, if captured.is_none() => captured = Some(result),
                }
            };
            match (supervised, captured) {
                (Ok(supervision), None) => (Ok(supervision), wait.await),
                (Ok(supervision), Some(captured)) => (Ok(supervision), captured),
                (Err(e), _) => (Err(e), Ok(())),
            }
        };

        let supervision = match supervised {
            Ok(supervision) => supervision,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Process could not be stopped");
                self.emit(Event::Error {
                    message: e.to_string(),
                    context: Some(run_id.to_string()),
                });
                return Err(e.into());
            }
        };
        if supervision.timed_out() {
            self.emit(Event::RunTimedOut {
                run_id,
                elapsed_secs: started.elapsed().as_secs_f64(),
            });
        }

        let closed = capture.close().await;
        if let Err(e) = &closed {
            error!(run_id = %run_id, error = %e, "Failed to close output capture");
        }
        let recorded = record_stop(&run_dir, supervision.exit_code, closed).await;
        self.emit(Event::RunStopped {
            run_id,
            exit_code: supervision.exit_code,
        });
        info!(
            run_id = %run_id,
            exit_code = supervision.exit_code,
            ending = ?supervision.ending,
            "Run finished"
        );
        recorded?;
        captured?;

        debug!(run_dir = %run_dir.path().display(), "Run recorded");
        Ok(RunOutcome {
            run_id,
            exit_code: supervision.exit_code,
            timed_out: supervision.timed_out(),
            run_dir: run_dir.path().to_path_buf(),
            params,
        })
    }
}

/// Marks the run as stopped even when capture failed to close, then
/// reports the close error.
async fn record_stop(
    run_dir: &RunDir,
    exit_code: i32,
    closed: std::result::Result<(), CaptureError>,
) -> Result<()> {
    run_dir.delete_lock().await?;
    run_dir.write_attr("stopped", &Utc::now()).await?;
    run_dir.write_attr("exit_status", &exit_code).await?;
    closed.map_err(RunnerError::from)
}

fn default_run_dir(run_id: Uuid) -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("opexec")
        .join("runs")
        .join(run_id.to_string())
}
