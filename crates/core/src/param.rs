use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::value::Value;

/// Declared type of a parameter, used for coercion and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagType {
    String,
    Int,
    Float,
    Boolean,
    Number,
    Path,
    ExistingPath,
    Auto,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::Path => "path",
            Self::ExistingPath => "existing-path",
            Self::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "boolean" | "bool" => Some(Self::Boolean),
            "number" => Some(Self::Number),
            "path" => Some(Self::Path),
            "existing-path" => Some(Self::ExistingPath),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// How a multi-value parameter is packed into a single encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ArgSplitRepr")]
pub enum ArgSplit {
    /// Shell-style whitespace separation with quoting.
    Whitespace,
    Delimiter(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArgSplitRepr {
    Enabled(bool),
    Delimiter(String),
}

impl TryFrom<ArgSplitRepr> for ArgSplit {
    type Error = String;

    fn try_from(repr: ArgSplitRepr) -> Result<Self, Self::Error> {
        match repr {
            ArgSplitRepr::Enabled(true) => Ok(ArgSplit::Whitespace),
            ArgSplitRepr::Enabled(false) => {
                Err("arg-split = false has no effect; omit the setting".to_string())
            }
            ArgSplitRepr::Delimiter(d) if d == "shlex" => Ok(ArgSplit::Whitespace),
            ArgSplitRepr::Delimiter(d) if d.is_empty() => {
                Err("arg-split delimiter cannot be empty".to_string())
            }
            ArgSplitRepr::Delimiter(d) => Ok(ArgSplit::Delimiter(d)),
        }
    }
}

/// One allowed value of a parameter.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(from = "ChoiceRepr")]
pub struct Choice {
    pub value: Value,
    pub alias: Option<String>,
    pub description: Option<String>,
    /// Values applied to other parameters when this choice is selected.
    pub flags: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChoiceRepr {
    Full {
        value: Value,
        #[serde(default)]
        alias: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        flags: BTreeMap<String, Value>,
    },
    Plain(Value),
}

impl From<ChoiceRepr> for Choice {
    fn from(repr: ChoiceRepr) -> Self {
        match repr {
            ChoiceRepr::Full {
                value,
                alias,
                description,
                flags,
            } => Choice {
                value,
                alias,
                description,
                flags,
            },
            ChoiceRepr::Plain(value) => Choice::new(value),
        }
    }
}

impl Choice {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_flag(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.flags.insert(name.into(), value.into());
        self
    }

    /// True when `value` selects this choice, by value or by alias.
    pub fn matches(&self, value: &Value) -> bool {
        if let (Some(alias), Value::Str(s)) = (&self.alias, value) {
            if alias == s {
                return true;
            }
        }
        match (self.value.as_f64(), value.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => &self.value == value,
        }
    }

    /// The text shown for this choice in error messages.
    pub fn label(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => self.value.to_string(),
        }
    }
}

/// Declaration of one configurable operation input.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ParameterSpec {
    pub name: String,
    /// Alternate name accepted from callers; ignored when equal to `name`.
    pub alias: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: Option<FlagType>,
    pub description: Option<String>,
    pub default: Value,
    pub required: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub choices: Vec<Choice>,
    pub allow_other: bool,
    pub arg_split: Option<ArgSplit>,
    pub arg_name: Option<String>,
    pub arg_skip: Option<bool>,
    /// When set, the parameter is emitted as a bare `--name` switch whenever
    /// its value equals this one.
    pub arg_switch: Option<Value>,
    /// Maps encoded values to the text emitted on the command line.
    pub arg_encoding: BTreeMap<String, String>,
    pub env_name: Option<String>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, flag_type: FlagType) -> Self {
        self.flag_type = Some(flag_type);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_choices(mut self, choices: Vec<Choice>) -> Self {
        self.choices = choices;
        self
    }

    pub fn with_split(mut self, split: ArgSplit) -> Self {
        self.arg_split = Some(split);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn allow_other(mut self) -> Self {
        self.allow_other = true;
        self
    }

    /// The alias, if it differs from the name.
    pub fn effective_alias(&self) -> Option<&str> {
        self.alias
            .as_deref()
            .filter(|alias| !alias.is_empty() && *alias != self.name)
    }
}
