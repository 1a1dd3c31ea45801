use thiserror::Error;

/// Validation failures raised while resolving parameter values.
///
/// Every variant names the offending parameter so the caller can correct
/// the specific assignment.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("missing required parameter(s): {}", .0.join(", "))]
    MissingRequired(Vec<String>),

    #[error("invalid value {value} for {name}: expected one of {}", .choices.join(", "))]
    InvalidChoice {
        name: String,
        value: String,
        choices: Vec<String>,
    },

    #[error("invalid value {value} for {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("unsupported parameter '{0}'")]
    NoSuchParameter(String),

    #[error("parameter '{name}' specified both by name and by alias '{alias}'")]
    AliasConflict { name: String, alias: String },
}

impl ParameterError {
    /// Create an invalid value error.
    pub fn invalid_value(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Name of the parameter the error refers to, when there is exactly one.
    pub fn parameter(&self) -> Option<&str> {
        match self {
            Self::MissingRequired(names) if names.len() == 1 => Some(&names[0]),
            Self::MissingRequired(_) => None,
            Self::InvalidChoice { name, .. }
            | Self::InvalidValue { name, .. }
            | Self::AliasConflict { name, .. } => Some(name),
            Self::NoSuchParameter(name) => Some(name),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unterminated quote in {0:?}")]
    UnterminatedQuote(String),

    #[error("trailing escape character in {0:?}")]
    TrailingEscape(String),
}
