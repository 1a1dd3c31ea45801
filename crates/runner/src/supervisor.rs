//! Process lifetime supervision.
//!
//! The supervisor polls a running process until it exits. When a time
//! budget runs out it sends SIGTERM, waits up to the kill delay, then sends
//! SIGKILL and checks once more after one poll interval.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{RunnerConfig, DEFAULT_KILL_DELAY, DEFAULT_POLL_INTERVAL};
use crate::error::ProcessError;

/// A running process the supervisor can observe and signal.
pub trait ProcessHandle {
    /// `None` once the process has been reaped.
    fn pid(&self) -> Option<u32>;

    /// The exit code if the process has exited; signal deaths are reported
    /// as the negated signal number.
    fn try_exit_code(&mut self) -> io::Result<Option<i32>>;

    fn terminate(&mut self) -> Result<(), ProcessError> {
        send_signal(self.pid(), Signal::SIGTERM)
    }

    fn kill(&mut self) -> Result<(), ProcessError> {
        send_signal(self.pid(), Signal::SIGKILL)
    }
}

/// A process that already exited is not an error.
fn send_signal(pid: Option<u32>, signal: Signal) -> Result<(), ProcessError> {
    let Some(pid) = pid else {
        return Ok(());
    };
    let raw = i32::try_from(pid).map_err(|_| ProcessError::Signal {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

pub fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(0),
    }
}

impl ProcessHandle for tokio::process::Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        Ok(self.try_wait()?.map(exit_code))
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// Exited on its own.
    Completed,
    /// Exited after SIGTERM.
    Terminated,
    /// Exited after SIGKILL.
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supervision {
    pub exit_code: i32,
    pub ending: Ending,
}

impl Supervision {
    pub fn timed_out(&self) -> bool {
        self.ending != Ending::Completed
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    poll_interval: Duration,
    kill_delay: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_KILL_DELAY)
    }
}

impl ProcessSupervisor {
    pub fn new(poll_interval: Duration, kill_delay: Duration) -> Self {
        Self {
            poll_interval,
            kill_delay,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.poll_interval, config.kill_delay)
    }

    /// Polls `process` until it exits, stopping it once `budget` elapses.
    ///
    /// Fails with [`ProcessError::Stuck`] if the process is still running
    /// after SIGKILL.
    pub async fn supervise<P>(
        &self,
        process: &mut P,
        budget: Option<Duration>,
    ) -> Result<Supervision, ProcessError>
    where
        P: ProcessHandle + ?Sized,
    {
        let started = Instant::now();
        let pid = process.pid().unwrap_or(0);
        debug!(pid, ?budget, "Supervising process");

        if let Some(exit_code) = self.poll_until(process, budget.map(|b| started + b)).await? {
            return Ok(Supervision {
                exit_code,
                ending: Ending::Completed,
            });
        }

        info!(
            pid,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Time budget exhausted, stopping process"
        );
        process.terminate()?;
        if let Some(exit_code) = self
            .poll_until(process, Some(Instant::now() + self.kill_delay))
            .await?
        {
            return Ok(Supervision {
                exit_code,
                ending: Ending::Terminated,
            });
        }

        warn!(
            pid,
            kill_delay_secs = self.kill_delay.as_secs_f64(),
            "Process ignored SIGTERM, killing it"
        );
        process.kill()?;
        sleep(self.poll_interval).await;
        match process.try_exit_code()? {
            Some(exit_code) => Ok(Supervision {
                exit_code,
                ending: Ending::Killed,
            }),
            None => Err(ProcessError::Stuck { pid }),
        }
    }

    /// Polls until the process exits or `deadline` passes; sleeps never
    /// overshoot the deadline.
    async fn poll_until<P>(
        &self,
        process: &mut P,
        deadline: Option<Instant>,
    ) -> Result<Option<i32>, ProcessError>
    where
        P: ProcessHandle + ?Sized,
    {
        loop {
            if let Some(exit_code) = process.try_exit_code()? {
                return Ok(Some(exit_code));
            }
            let pause = match deadline {
                None => self.poll_interval,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.poll_interval.min(deadline - now)
                }
            };
            sleep(pause).await;
        }
    }
}
