use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// A literal parameter value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null and the empty string both count as "no value" for required checks.
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Str(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::codec::encode(self))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// A value computed elsewhere, written as `name[args]` or `[args]`.
///
/// `uniform[0:1]` and `[1:10]` are typical search-space expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagFunction {
    pub name: Option<String>,
    pub args: String,
}

fn function_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_\-\.]*)?\[(.*)\]$").expect("valid function pattern")
    })
}

impl FlagFunction {
    /// Parses `text` as a function expression.
    ///
    /// An unnamed bracket expression is only a function when its arguments
    /// contain a `:`; otherwise it is a list literal.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = function_pattern().captures(text)?;
        let name = caps.get(1).map(|m| m.as_str().to_string());
        let args = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        if name.is_none() && !args.contains(':') {
            return None;
        }
        Some(Self {
            name,
            args: args.to_string(),
        })
    }
}

impl fmt::Display for FlagFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name.as_deref().unwrap_or(""), self.args)
    }
}

impl Serialize for FlagFunction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A parameter value as seen by the resolver: either literal data or a
/// deferred expression that must pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Literal(Value),
    Deferred(FlagFunction),
}

impl ParamValue {
    pub fn null() -> Self {
        ParamValue::Literal(Value::Null)
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            ParamValue::Literal(v) => Some(v),
            ParamValue::Deferred(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Literal(Value::Null))
    }

    pub fn is_missing(&self) -> bool {
        match self {
            ParamValue::Literal(v) => v.is_missing(),
            ParamValue::Deferred(_) => false,
        }
    }
}

impl Default for ParamValue {
    fn default() -> Self {
        Self::null()
    }
}

macro_rules! literal_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(v: $ty) -> Self {
                    ParamValue::Literal(v.into())
                }
            }
        )*
    };
}

literal_from!(Value, bool, i64, f64, &str, String);

impl From<FlagFunction> for ParamValue {
    fn from(f: FlagFunction) -> Self {
        ParamValue::Deferred(f)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Literal(v) => v.fmt(f),
            ParamValue::Deferred(func) => func.fmt(f),
        }
    }
}

/// Parameter name to resolved value.
pub type ResolvedParameters = BTreeMap<String, ParamValue>;
