//! Command construction from an operation's execution template.

use std::collections::BTreeMap;

use opexec_core::{
    encode, split_cmd, split_encoded, ArgSplit, OperationDef, ParamValue, ParameterSpec,
    ResolvedParameters, Value,
};
use tracing::warn;

use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};

/// Placeholder replaced by the configured interpreter at expansion time.
pub const INTERPRETER: &str = "${interpreter}";
const MAIN_ARGS: &str = "${main_args}";
const PARAM_ARGS: &str = "${param_args}";
const PROJECT_DIR: &str = "${project_dir}";

/// Stands in for the parameter arguments until [`Command::expand`] runs.
pub const PARAM_ARGS_SENTINEL: &str = "__param_args__";

/// Attributes recorded for a run alongside its command.
pub type RunAttrs = BTreeMap<String, serde_json::Value>;

/// How one parameter is delivered to the process.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CmdFlag {
    /// Argument name when it differs from the parameter name.
    pub arg_name: Option<String>,
    /// Deliver through the environment only.
    pub arg_skip: bool,
    /// Emit a bare `--NAME` when the value equals this, nothing otherwise.
    pub arg_switch: Option<Value>,
    pub arg_split: Option<ArgSplit>,
    /// Maps encoded values to the text actually passed.
    pub arg_encoding: BTreeMap<String, String>,
    /// Overrides the `FLAG_<NAME>` variable name.
    pub env_name: Option<String>,
}

impl CmdFlag {
    pub fn for_spec(spec: &ParameterSpec, default_arg_skip: bool) -> Self {
        Self {
            arg_name: spec.arg_name.clone(),
            arg_skip: spec.arg_skip.unwrap_or(default_arg_skip),
            arg_switch: spec.arg_switch.clone(),
            arg_split: spec.arg_split.clone(),
            arg_encoding: spec.arg_encoding.clone(),
            env_name: spec.env_name.clone(),
        }
    }

    fn args(&self, name: &str, value: &ParamValue) -> Vec<String> {
        let arg_name = format!("--{}", self.arg_name.as_deref().unwrap_or(name));
        if let Some(switch) = &self.arg_switch {
            return if value.as_literal() == Some(switch) {
                vec![arg_name]
            } else {
                Vec::new()
            };
        }
        let parts: Vec<ParamValue> = match (value, &self.arg_split) {
            (ParamValue::Literal(Value::List(items)), _) => {
                items.iter().cloned().map(ParamValue::Literal).collect()
            }
            (ParamValue::Literal(Value::Str(text)), Some(split)) => {
                split_encoded(text, split).unwrap_or_else(|e| {
                    warn!(
                        parameter = name,
                        error = %e,
                        "Passing unsplittable value as one argument"
                    );
                    vec![value.clone()]
                })
            }
            _ => vec![value.clone()],
        };
        std::iter::once(arg_name)
            .chain(parts.iter().map(|part| self.encode(part)))
            .collect()
    }

    fn encode(&self, value: &ParamValue) -> String {
        let text = arg_text(value);
        match self.arg_encoding.get(&text) {
            Some(mapped) => mapped.clone(),
            None => text,
        }
    }

    fn env_name(&self, name: &str) -> String {
        match &self.env_name {
            Some(env_name) => env_name.clone(),
            None => format!("FLAG_{}", env_safe(name)),
        }
    }
}

/// Text of a value as the process sees it: strings are passed raw, other
/// values in their encoded form.
fn arg_text(value: &ParamValue) -> String {
    match value {
        ParamValue::Literal(Value::Str(s)) => s.clone(),
        ParamValue::Literal(v) => encode(v),
        ParamValue::Deferred(f) => f.to_string(),
    }
}

fn env_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// A command line with the parameter arguments still to be filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Argv template; may hold `${interpreter}` and the parameter sentinel.
    pub args: Vec<String>,
    /// Environment before parameter variables are added.
    pub env: BTreeMap<String, String>,
    /// Delivery settings keyed by parameter name.
    pub flags: BTreeMap<String, CmdFlag>,
    /// `args` to pass parameters on the command line; anything else leaves
    /// them to the environment.
    pub flags_dest: String,
}

impl Command {
    /// Produces the final argv and environment for `params`.
    ///
    /// Parameters without a flag entry use the default encoding. Null values
    /// are neither passed as arguments nor exported.
    pub fn expand(
        &self,
        params: &ResolvedParameters,
        interpreter: &str,
    ) -> (Vec<String>, BTreeMap<String, String>) {
        let default_flag = CmdFlag::default();
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            if arg != PARAM_ARGS_SENTINEL {
                args.push(arg.replace(INTERPRETER, interpreter));
                continue;
            }
            if self.flags_dest != "args" {
                continue;
            }
            for (name, value) in params.iter().filter(|(_, value)| !value.is_null()) {
                let flag = self.flags.get(name).unwrap_or(&default_flag);
                if !flag.arg_skip {
                    args.extend(flag.args(name, value));
                }
            }
        }

        let mut env = self.env.clone();
        for (name, value) in params.iter().filter(|(_, value)| !value.is_null()) {
            let flag = self.flags.get(name).unwrap_or(&default_flag);
            env.insert(flag.env_name(name), arg_text(value));
        }
        (args, env)
    }
}

struct Template {
    text: String,
    attrs: RunAttrs,
}

type TemplateStrategy = fn(&CommandBuilder, &OperationDef) -> Option<Template>;

/// Tried in order; the first template found wins.
const TEMPLATE_STRATEGIES: [TemplateStrategy; 3] =
    [explicit_template, main_template, steps_template];

fn explicit_template(_: &CommandBuilder, op: &OperationDef) -> Option<Template> {
    let exec = op.exec.as_ref()?;
    if op.main.is_some() {
        warn!(
            operation = %op.name,
            "operation 'exec' and 'main' both specified, ignoring 'main'"
        );
    }
    if op.steps.is_some() {
        warn!(
            operation = %op.name,
            "operation 'exec' and 'steps' both specified, ignoring 'steps'"
        );
    }
    Some(Template {
        text: exec.clone(),
        attrs: RunAttrs::new(),
    })
}

fn main_template(builder: &CommandBuilder, op: &OperationDef) -> Option<Template> {
    op.main.as_ref()?;
    if op.steps.is_some() {
        warn!(
            operation = %op.name,
            "operation 'main' and 'steps' both specified, ignoring 'steps'"
        );
    }
    Some(Template {
        text: format!(
            "{} -um {} {} -- {}",
            INTERPRETER, builder.main_runner, MAIN_ARGS, PARAM_ARGS
        ),
        attrs: RunAttrs::new(),
    })
}

fn steps_template(builder: &CommandBuilder, op: &OperationDef) -> Option<Template> {
    let steps = op.steps.as_ref()?;
    let mut attrs = RunAttrs::new();
    attrs.insert("steps".to_string(), serde_json::Value::Array(steps.clone()));
    Some(Template {
        text: format!("{} -um {}", INTERPRETER, builder.step_runner),
        attrs,
    })
}

/// Builds [`Command`]s from operation definitions.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    main_runner: String,
    step_runner: String,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

impl CommandBuilder {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            main_runner: config.main_runner.clone(),
            step_runner: config.step_runner.clone(),
        }
    }

    /// Builds the command for `op`, with `extra_env` overriding the
    /// operation's own environment.
    ///
    /// Run attributes are only produced by the `steps` shorthand.
    pub fn build(
        &self,
        op: &OperationDef,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<(Command, RunAttrs)> {
        let template = TEMPLATE_STRATEGIES
            .iter()
            .find_map(|strategy| strategy(self, op))
            .ok_or_else(|| {
                RunnerError::invalid_definition(&op.name, "must define either exec, main, or steps")
            })?;

        let main_args = split(op, op.main.as_deref().unwrap_or_default())?;
        let mut args = split(op, &template.text)?;
        splice(&mut args, MAIN_ARGS, &main_args);
        for arg in args.iter_mut().filter(|arg| arg.as_str() == PARAM_ARGS) {
            *arg = PARAM_ARGS_SENTINEL.to_string();
        }
        if let Some(dir) = &op.project_dir {
            let dir = dir.to_string_lossy();
            for arg in args.iter_mut() {
                if arg.contains(PROJECT_DIR) {
                    *arg = arg.replace(PROJECT_DIR, &dir);
                }
            }
        }

        let flags = op
            .parameters
            .iter()
            .map(|spec| (spec.name.clone(), CmdFlag::for_spec(spec, op.default_arg_skip)))
            .collect();

        let command = Command {
            args,
            env: command_env(op, extra_env),
            flags,
            flags_dest: op.flags_dest().to_string(),
        };
        Ok((command, template.attrs))
    }
}

fn split(op: &OperationDef, text: &str) -> Result<Vec<String>> {
    split_cmd(text).map_err(|e| RunnerError::invalid_definition(&op.name, e.to_string()))
}

/// Replaces each `token` in `args` with `replacement`, resuming the scan
/// after the inserted tokens.
fn splice(args: &mut Vec<String>, token: &str, replacement: &[String]) {
    let mut i = 0;
    while i < args.len() {
        if args[i] == token {
            args.splice(i..i + 1, replacement.iter().cloned());
            i += replacement.len();
        } else {
            i += 1;
        }
    }
}

fn command_env(
    op: &OperationDef,
    extra_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = op.env.clone();
    env.extend(extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    let project_dir = op
        .project_dir
        .as_ref()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_default();
    env.insert("PROJECT_DIR".to_string(), project_dir);
    if let Some(dest) = &op.flags_dest {
        env.insert("FLAGS_DEST".to_string(), dest.clone());
    }
    if op.handle_keyboard_interrupt {
        env.insert("HANDLE_KEYBOARD_INTERRUPT".to_string(), "1".to_string());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use opexec_core::{FlagFunction, FlagType};
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    /// Runs `f` with log output captured.
    fn with_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, buffer.contents())
    }

    fn build(op: &OperationDef) -> Result<(Command, RunAttrs)> {
        CommandBuilder::default().build(op, &BTreeMap::new())
    }

    #[test]
    fn test_explicit_template_splices_main_args() {
        let op = OperationDef::new("train")
            .with_exec("${interpreter} -run ${main_args} -- ${param_args}")
            .with_main("train.py");

        let (result, logs) = with_logs(|| build(&op));
        let (command, attrs) = result.unwrap();

        assert_eq!(
            command.args,
            vec!["${interpreter}", "-run", "train.py", "--", PARAM_ARGS_SENTINEL]
        );
        assert!(attrs.is_empty());
        assert!(logs.contains("ignoring 'main'"));
    }

    #[test]
    fn test_splice_does_not_rescan_inserted_tokens() {
        let op = OperationDef::new("echo")
            .with_exec("echo ${main_args} x ${main_args}")
            .with_main("a ${main_args} b");
        let (command, _) = build(&op).unwrap();
        assert_eq!(
            command.args,
            vec!["echo", "a", "${main_args}", "b", "x", "a", "${main_args}", "b"]
        );
    }

    #[test]
    fn test_main_template() {
        let op = OperationDef::new("train").with_main("pkg.train --epochs-from 'a b'");
        let (command, attrs) = build(&op).unwrap();
        assert_eq!(
            command.args,
            vec![
                "${interpreter}",
                "-um",
                "opexec.main",
                "pkg.train",
                "--epochs-from",
                "a b",
                "--",
                PARAM_ARGS_SENTINEL,
            ]
        );
        assert!(attrs.is_empty());
    }

    #[test]
    fn test_steps_template_records_attrs() {
        let steps = vec![serde_json::json!("prepare"), serde_json::json!({"run": "train"})];
        let op = OperationDef::new("pipeline").with_steps(steps.clone());
        let (command, attrs) = build(&op).unwrap();

        assert_eq!(command.args, vec!["${interpreter}", "-um", "opexec.steps"]);
        assert_eq!(attrs["steps"], serde_json::Value::Array(steps));
    }

    #[test]
    fn test_main_wins_over_steps() {
        let op = OperationDef::new("train")
            .with_main("train")
            .with_steps(vec![serde_json::json!("prepare")]);
        let (result, logs) = with_logs(|| build(&op));
        let (command, attrs) = result.unwrap();
        assert!(command.args.contains(&"train".to_string()));
        assert!(attrs.is_empty());
        assert!(logs.contains("ignoring 'steps'"));
    }

    #[test]
    fn test_missing_template_is_invalid_definition() {
        let err = build(&OperationDef::new("empty")).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidDefinition { .. }));
        assert!(!err.is_parameter_error());
    }

    #[test]
    fn test_unbalanced_quotes_are_invalid_definition() {
        let err = build(&OperationDef::new("bad").with_exec("echo 'oops")).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_project_dir_substitution_and_env() {
        let mut op = OperationDef::new("train")
            .with_exec("${project_dir}/bin/train --out=${project_dir}/out")
            .with_project_dir("/work/proj")
            .with_env("MODE", "fast")
            .with_env("SEED", "1");
        op.flags_dest = Some("globals".to_string());
        op.handle_keyboard_interrupt = true;

        let extra = BTreeMap::from([("SEED".to_string(), "7".to_string())]);
        let (command, _) = CommandBuilder::default().build(&op, &extra).unwrap();

        assert_eq!(
            command.args,
            vec!["/work/proj/bin/train", "--out=/work/proj/out"]
        );
        assert_eq!(command.env["MODE"], "fast");
        assert_eq!(command.env["SEED"], "7");
        assert_eq!(command.env["PROJECT_DIR"], "/work/proj");
        assert_eq!(command.env["FLAGS_DEST"], "globals");
        assert_eq!(command.env["HANDLE_KEYBOARD_INTERRUPT"], "1");
        assert_eq!(command.flags_dest, "globals");
    }

    #[test]
    fn test_env_without_optional_entries() {
        let (command, _) = build(&OperationDef::new("t").with_exec("true")).unwrap();
        assert_eq!(command.env["PROJECT_DIR"], "");
        assert!(!command.env.contains_key("FLAGS_DEST"));
        assert!(!command.env.contains_key("HANDLE_KEYBOARD_INTERRUPT"));
        assert_eq!(command.flags_dest, "args");
    }

    #[test]
    fn test_cmd_flag_arg_skip_falls_back_to_operation() {
        let mut op = OperationDef::new("t")
            .with_exec("true")
            .with_parameter(ParameterSpec::new("a"))
            .with_parameter(ParameterSpec {
                arg_skip: Some(false),
                ..ParameterSpec::new("b")
            });
        op.default_arg_skip = true;
        let (command, _) = build(&op).unwrap();
        assert!(command.flags["a"].arg_skip);
        assert!(!command.flags["b"].arg_skip);
    }

    fn expand_op(
        op: OperationDef,
        params: &[(&str, ParamValue)],
    ) -> (Vec<String>, BTreeMap<String, String>) {
        let (command, _) = build(&op).unwrap();
        let params: ResolvedParameters = params
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        command.expand(&params, "python3")
    }

    #[test]
    fn test_expand_param_args() {
        let op = OperationDef::new("train")
            .with_exec("${interpreter} train.py ${param_args}")
            .with_parameter(ParameterSpec::new("lr").with_type(FlagType::Float))
            .with_parameter(ParameterSpec {
                arg_name: Some("model-name".into()),
                ..ParameterSpec::new("model")
            })
            .with_parameter(ParameterSpec {
                arg_skip: Some(true),
                env_name: Some("SECRET_TOKEN".into()),
                ..ParameterSpec::new("token")
            })
            .with_parameter(ParameterSpec::new("note"));

        let (args, env) = expand_op(
            op,
            &[
                ("lr", 0.1.into()),
                ("model", "1".into()),
                ("note", ParamValue::null()),
                ("token", "abc".into()),
            ],
        );

        assert_eq!(
            args,
            vec!["python3", "train.py", "--lr", "0.1", "--model-name", "1"]
        );
        assert_eq!(env["FLAG_LR"], "0.1");
        assert_eq!(env["FLAG_MODEL"], "1");
        assert_eq!(env["SECRET_TOKEN"], "abc");
        assert!(!env.contains_key("FLAG_NOTE"));
    }

    #[test]
    fn test_expand_switch_split_and_encoding() {
        let op = OperationDef::new("t")
            .with_exec("run ${param_args}")
            .with_parameter(ParameterSpec {
                arg_switch: Some(Value::Bool(true)),
                ..ParameterSpec::new("verbose").with_type(FlagType::Boolean)
            })
            .with_parameter(ParameterSpec {
                arg_switch: Some(Value::Bool(true)),
                ..ParameterSpec::new("quiet").with_type(FlagType::Boolean)
            })
            .with_parameter(ParameterSpec::new("sizes").with_split(ArgSplit::Delimiter(",".into())))
            .with_parameter(ParameterSpec {
                arg_encoding: BTreeMap::from([("true".to_string(), "1".to_string())]),
                ..ParameterSpec::new("use-gpu")
            });

        let (args, _) = expand_op(
            op,
            &[
                ("quiet", false.into()),
                ("sizes", "1,2,3".into()),
                ("use-gpu", true.into()),
                ("verbose", true.into()),
            ],
        );
        assert_eq!(
            args,
            vec!["run", "--sizes", "1", "2", "3", "--use-gpu", "1", "--verbose"]
        );
    }

    #[test]
    fn test_expand_other_flags_dest_drops_sentinel() {
        let mut op = OperationDef::new("t")
            .with_exec("run ${param_args} end")
            .with_parameter(ParameterSpec::new("x"));
        op.flags_dest = Some("globals".into());
        let (args, env) = expand_op(op, &[("x", 3i64.into())]);
        assert_eq!(args, vec!["run", "end"]);
        assert_eq!(env["FLAG_X"], "3");
    }

    #[test]
    fn test_expand_unspecified_and_deferred_params() {
        let op = OperationDef::new("t")
            .with_exec("run ${param_args}")
            .with_parameter(ParameterSpec::new("rate").with_alias("lr"));
        let function = FlagFunction::parse("uniform[0:1]").unwrap();

        // A forced alias conflict leaves both entries; both are emitted.
        let (args, _) = expand_op(op, &[("lr", 0.5.into()), ("rate", function.into())]);
        assert_eq!(args, vec!["run", "--lr", "0.5", "--rate", "uniform[0:1]"]);
    }
}
