//! Parameter resolution.
//!
//! Turns the values a caller supplied into a complete, typed value map for
//! an operation: aliases are folded into canonical names, defaults fill the
//! gaps, values are coerced to their declared types and then validated.
//! Values selected from a choice may imply values for other parameters.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use opexec_core::{
    decode, encode, join_encoded, split_encoded, ArgSplit, FlagType, ParamValue, ParameterError,
    ParameterSpec, ResolvedParameters, Value,
};
use tracing::debug;

type Result<T> = std::result::Result<T, ParameterError>;

/// Resolves `user_values` against `specs`.
///
/// With `force`, validation is skipped, alias conflicts keep both entries and
/// values that fail coercion are kept as given.
pub fn resolve(
    specs: &[ParameterSpec],
    user_values: &BTreeMap<String, ParamValue>,
    force: bool,
) -> Result<ResolvedParameters> {
    let mut values = normalize_aliases(specs, user_values, force)?;
    let explicit: BTreeSet<String> = values
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, _)| name.clone())
        .collect();

    apply_defaults(specs, &mut values);
    apply_coercion(specs, &mut values, force)?;
    if !force {
        check_no_such_parameters(specs, &values)?;
        check_values(specs, &values)?;
        check_required(specs, &values)?;
    }
    apply_choice_values(specs, &explicit, &mut values);
    Ok(values)
}

fn normalize_aliases(
    specs: &[ParameterSpec],
    user_values: &BTreeMap<String, ParamValue>,
    force: bool,
) -> Result<ResolvedParameters> {
    let mut values = user_values.clone();
    for spec in specs {
        let Some(alias) = spec.effective_alias() else {
            continue;
        };
        if !values.contains_key(alias) {
            continue;
        }
        if values.contains_key(&spec.name) {
            if !force {
                return Err(ParameterError::AliasConflict {
                    name: spec.name.clone(),
                    alias: alias.to_string(),
                });
            }
            debug!(parameter = %spec.name, alias, "Keeping both name and alias values");
            continue;
        }
        if let Some(value) = values.remove(alias) {
            values.insert(spec.name.clone(), value);
        }
    }
    Ok(values)
}

fn apply_defaults(specs: &[ParameterSpec], values: &mut ResolvedParameters) {
    for spec in specs {
        values
            .entry(spec.name.clone())
            .or_insert_with(|| ParamValue::Literal(spec.default.clone()));
    }
}

fn apply_coercion(
    specs: &[ParameterSpec],
    values: &mut ResolvedParameters,
    force: bool,
) -> Result<()> {
    for spec in specs {
        let Some(value) = values.get(&spec.name) else {
            continue;
        };
        match coerce(spec, value) {
            Ok(coerced) => {
                values.insert(spec.name.clone(), coerced);
            }
            Err(e) if force => {
                debug!(parameter = %spec.name, error = %e, "Keeping uncoerced value");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Converts `value` to the type declared by `spec`.
///
/// Deferred values, nulls and empty strings pass through unchanged.
pub fn coerce(spec: &ParameterSpec, value: &ParamValue) -> Result<ParamValue> {
    let literal = match value {
        ParamValue::Deferred(_) => return Ok(value.clone()),
        ParamValue::Literal(v) if v.is_missing() => return Ok(value.clone()),
        ParamValue::Literal(v) => v,
    };
    match &spec.arg_split {
        Some(split) => coerce_split(spec, split, literal),
        None => coerce_value(spec, literal).map(ParamValue::Literal),
    }
}

fn coerce_split(spec: &ParameterSpec, split: &ArgSplit, value: &Value) -> Result<ParamValue> {
    let parts: Vec<ParamValue> = match value {
        Value::List(items) => items.iter().cloned().map(ParamValue::Literal).collect(),
        Value::Str(text) => split_encoded(text, split)
            .map_err(|e| invalid(spec, value, e.to_string()))?,
        other => vec![ParamValue::Literal(other.clone())],
    };
    let coerced = parts
        .iter()
        .map(|part| match part {
            ParamValue::Literal(v) => coerce_value(spec, v).map(ParamValue::Literal),
            ParamValue::Deferred(_) => Ok(part.clone()),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ParamValue::Literal(Value::Str(join_encoded(&coerced, split))))
}

fn coerce_value(spec: &ParameterSpec, value: &Value) -> Result<Value> {
    match value {
        Value::List(items) => items
            .iter()
            .map(|item| coerce_value(spec, item))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        _ if value.is_missing() => Ok(value.clone()),
        _ => match spec.flag_type {
            None | Some(FlagType::Auto) => Ok(value.clone()),
            Some(flag_type) => coerce_typed(flag_type, value).ok_or_else(|| {
                invalid(spec, value, format!("expected {}", flag_type.as_str()))
            }),
        },
    }
}

fn coerce_typed(flag_type: FlagType, value: &Value) -> Option<Value> {
    match (flag_type, value) {
        (FlagType::String, Value::Str(_)) => Some(value.clone()),
        (FlagType::String, other) => Some(Value::Str(encode(other))),

        (FlagType::Int, Value::Int(_)) => Some(value.clone()),

        (FlagType::Float, Value::Int(i)) => Some(Value::Float(*i as f64)),
        (FlagType::Float, Value::Float(_)) => Some(value.clone()),

        (FlagType::Number, Value::Int(_) | Value::Float(_)) => Some(value.clone()),

        (FlagType::Boolean, Value::Bool(_)) => Some(value.clone()),
        (FlagType::Boolean, Value::Int(0)) => Some(Value::Bool(false)),
        (FlagType::Boolean, Value::Int(1)) => Some(Value::Bool(true)),
        (FlagType::Boolean, Value::Str(s)) => parse_bool(s).map(Value::Bool),

        (FlagType::Path | FlagType::ExistingPath, Value::Str(s)) => {
            Some(Value::Str(absolute_path(s)))
        }
        (FlagType::Path | FlagType::ExistingPath, other) => {
            Some(Value::Str(absolute_path(&encode(other))))
        }

        // Numeric types accept their textual forms.
        (FlagType::Int | FlagType::Float | FlagType::Number, Value::Str(s)) => match decode(s) {
            ParamValue::Literal(decoded @ (Value::Int(_) | Value::Float(_))) => {
                coerce_typed(flag_type, &decoded)
            }
            _ => None,
        },

        _ => None,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Expands a leading `~` to the home directory.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        _ => PathBuf::from(path),
    }
}

fn absolute_path(path: &str) -> String {
    let expanded = expand_home(path);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(expanded),
            Err(_) => expanded,
        }
    };
    absolute.to_string_lossy().into_owned()
}

fn check_no_such_parameters(specs: &[ParameterSpec], values: &ResolvedParameters) -> Result<()> {
    let known: BTreeSet<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
    match values.keys().find(|name| !known.contains(name.as_str())) {
        Some(name) => Err(ParameterError::NoSuchParameter(name.clone())),
        None => Ok(()),
    }
}

fn check_values(specs: &[ParameterSpec], values: &ResolvedParameters) -> Result<()> {
    for spec in specs {
        let Some(ParamValue::Literal(value)) = values.get(&spec.name) else {
            continue;
        };
        for item in check_targets(spec, value)? {
            check_choice(spec, &item)?;
            check_type(spec, &item)?;
            check_range(spec, &item)?;
        }
    }
    Ok(())
}

/// The individual values to validate: list items, or the parts of a split
/// value. Deferred parts are skipped.
fn check_targets(spec: &ParameterSpec, value: &Value) -> Result<Vec<Value>> {
    match (value, &spec.arg_split) {
        (Value::List(items), _) => Ok(items.clone()),
        (Value::Str(text), Some(split)) => Ok(split_encoded(text, split)
            .map_err(|e| invalid(spec, value, e.to_string()))?
            .into_iter()
            .filter_map(|part| match part {
                ParamValue::Literal(v) => Some(v),
                ParamValue::Deferred(_) => None,
            })
            .collect()),
        _ => Ok(vec![value.clone()]),
    }
}

fn check_choice(spec: &ParameterSpec, value: &Value) -> Result<()> {
    if value.is_missing() || spec.choices.is_empty() || spec.allow_other {
        return Ok(());
    }
    if spec.choices.iter().any(|choice| choice.matches(value)) {
        return Ok(());
    }
    Err(ParameterError::InvalidChoice {
        name: spec.name.clone(),
        value: encode(value),
        choices: spec.choices.iter().map(|choice| choice.label()).collect(),
    })
}

fn check_type(spec: &ParameterSpec, value: &Value) -> Result<()> {
    if spec.flag_type != Some(FlagType::ExistingPath) {
        return Ok(());
    }
    match value {
        Value::Str(path) if !path.is_empty() && !Path::new(path).exists() => {
            Err(invalid(spec, value, "path does not exist"))
        }
        _ => Ok(()),
    }
}

fn check_range(spec: &ParameterSpec, value: &Value) -> Result<()> {
    let Some(x) = value.as_f64() else {
        return Ok(());
    };
    if let Some(min) = spec.min {
        if x < min {
            return Err(invalid(spec, value, format!("out of range (less than min {})", min)));
        }
    }
    if let Some(max) = spec.max {
        if x > max {
            return Err(invalid(spec, value, format!("out of range (greater than max {})", max)));
        }
    }
    Ok(())
}

fn check_required(specs: &[ParameterSpec], values: &ResolvedParameters) -> Result<()> {
    let missing: Vec<String> = specs
        .iter()
        .filter(|spec| spec.required)
        .filter(|spec| values.get(&spec.name).map_or(true, ParamValue::is_missing))
        .map(|spec| spec.name.clone())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ParameterError::MissingRequired(missing))
    }
}

/// Replaces choice aliases with their values and applies the values a
/// selected choice implies for parameters the caller left unset.
fn apply_choice_values(
    specs: &[ParameterSpec],
    explicit: &BTreeSet<String>,
    values: &mut ResolvedParameters,
) {
    for spec in specs.iter().filter(|spec| !spec.choices.is_empty()) {
        let Some(ParamValue::Literal(current)) = values.get(&spec.name).cloned() else {
            continue;
        };
        if current.is_null() {
            continue;
        }
        let Some(choice) = spec.choices.iter().find(|choice| choice.matches(&current)) else {
            continue;
        };
        let by_alias = matches!(
            (&current, &choice.alias),
            (Value::Str(s), Some(alias)) if s == alias
        );
        if by_alias {
            values.insert(spec.name.clone(), ParamValue::Literal(choice.value.clone()));
        }
        for (name, implied) in &choice.flags {
            if name != &spec.name && !explicit.contains(name) {
                values.insert(name.clone(), ParamValue::Literal(implied.clone()));
            }
        }
    }
}

fn invalid(spec: &ParameterSpec, value: &Value, reason: impl Into<String>) -> ParameterError {
    ParameterError::invalid_value(&spec.name, encode(value), reason)
}
