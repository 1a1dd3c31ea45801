//! `NAME=VALUE` parameter assignments.

use std::collections::BTreeMap;

use opexec_core::{decode, encode_param, FlagType, ParamValue, ParameterSpec};

use crate::error::{Result, RunnerError};
use crate::params::expand_home;

/// Parses `NAME=VALUE` arguments into user values.
///
/// Values of string and path parameters are kept as typed; everything else
/// is decoded. A value starting with `~/` is expanded to the home directory.
/// Every argument without `=` is reported in a single error.
pub fn parse_assigns<S: AsRef<str>>(
    args: &[S],
    specs: Option<&[ParameterSpec]>,
) -> Result<BTreeMap<String, ParamValue>> {
    let mut values = BTreeMap::new();
    let mut invalid = Vec::new();

    for arg in args {
        let arg = arg.as_ref();
        let Some((name, raw)) = arg.split_once('=') else {
            invalid.push(arg.to_string());
            continue;
        };
        if name.is_empty() {
            invalid.push(arg.to_string());
            continue;
        }
        let raw = if raw == "~" || raw.starts_with("~/") {
            expand_home(raw).to_string_lossy().into_owned()
        } else {
            raw.to_string()
        };
        let value = if keeps_text(name, specs) {
            ParamValue::from(raw)
        } else {
            decode(&raw)
        };
        values.insert(name.to_string(), value);
    }

    if invalid.is_empty() {
        Ok(values)
    } else {
        Err(RunnerError::InvalidAssign(invalid))
    }
}

fn keeps_text(name: &str, specs: Option<&[ParameterSpec]>) -> bool {
    let Some(specs) = specs else {
        return false;
    };
    let spec = specs
        .iter()
        .find(|spec| spec.name == name)
        .or_else(|| specs.iter().find(|spec| spec.effective_alias() == Some(name)));
    matches!(
        spec.and_then(|spec| spec.flag_type),
        Some(FlagType::String | FlagType::Path | FlagType::ExistingPath)
    )
}

/// Formats values as sorted `NAME=VALUE` strings.
pub fn format_assigns(values: &BTreeMap<String, ParamValue>) -> Vec<String> {
    values
        .iter()
        .map(|(name, value)| format!("{}={}", name, encode_param(value)))
        .collect()
}
