use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::param::ParameterSpec;

/// A fully looked-up operation, ready to be turned into a command.
///
/// Exactly one of `exec`, `main` or `steps` selects the execution template;
/// when several are present `exec` wins over `main`, which wins over `steps`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OperationDef {
    #[serde(default)]
    pub name: String,
    /// Explicit command line template.
    #[serde(default)]
    pub exec: Option<String>,
    /// Module and arguments run through the interpreter's module runner.
    #[serde(default)]
    pub main: Option<String>,
    /// Sub-operations run in sequence by the step runner.
    #[serde(default)]
    pub steps: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Where parameter values are delivered; `args` when unset.
    #[serde(default)]
    pub flags_dest: Option<String>,
    #[serde(default)]
    pub handle_keyboard_interrupt: bool,
    /// Fallback for parameters that leave `arg-skip` unset.
    #[serde(default)]
    pub default_arg_skip: bool,
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
    #[serde(default, rename = "flags")]
    pub parameters: Vec<ParameterSpec>,
}

impl OperationDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_exec(mut self, exec: impl Into<String>) -> Self {
        self.exec = Some(exec.into());
        self
    }

    pub fn with_main(mut self, main: impl Into<String>) -> Self {
        self.main = Some(main.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<serde_json::Value>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub fn with_parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn flags_dest(&self) -> &str {
        self.flags_dest.as_deref().unwrap_or("args")
    }
}
