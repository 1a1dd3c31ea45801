use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_KILL_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_MAIN_RUNNER: &str = "opexec.main";
pub const DEFAULT_STEP_RUNNER: &str = "opexec.steps";

/// Runtime settings for the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunnerConfig {
    /// How often the supervisor checks whether the child exited
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Grace period between the terminate signal and the forced kill
    #[serde(with = "secs")]
    pub kill_delay: Duration,
    /// Upper bound on waiting for the output lock when closing capture
    #[serde(with = "secs")]
    pub close_timeout: Duration,
    /// Replaces `${interpreter}` in command templates
    pub interpreter: String,
    /// Module run by the `main` shorthand
    pub main_runner: String,
    /// Module run by the `steps` shorthand
    pub step_runner: String,
    /// Capture output without mirroring it to this process's streams
    pub quiet: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            kill_delay: DEFAULT_KILL_DELAY,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            interpreter: DEFAULT_INTERPRETER.to_string(),
            main_runner: DEFAULT_MAIN_RUNNER.to_string(),
            step_runner: DEFAULT_STEP_RUNNER.to_string(),
            quiet: false,
        }
    }
}

impl RunnerConfig {
    /// Applies `OPEXEC_*` overrides from `lookup` (usually the process
    /// environment); unparseable values are logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("OPEXEC_POLL_INTERVAL") {
            match parse_secs(&v) {
                Some(d) => self.poll_interval = d,
                None => warn!(value = %v, "Ignoring invalid OPEXEC_POLL_INTERVAL"),
            }
        }
        if let Some(v) = lookup("OPEXEC_KILL_DELAY") {
            match parse_secs(&v) {
                Some(d) => self.kill_delay = d,
                None => warn!(value = %v, "Ignoring invalid OPEXEC_KILL_DELAY"),
            }
        }
        if let Some(v) = lookup("OPEXEC_INTERPRETER") {
            if !v.trim().is_empty() {
                self.interpreter = v;
            }
        }
        if let Some(v) = lookup("OPEXEC_QUIET") {
            self.quiet = matches!(v.trim(), "1" | "true" | "yes");
        }
        self
    }
}

fn parse_secs(s: &str) -> Option<Duration> {
    s.trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Serializes a `Duration` as fractional seconds.
mod secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
