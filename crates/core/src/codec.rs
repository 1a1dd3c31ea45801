//! Textual encoding of parameter values.
//!
//! Values cross the command-line boundary as text in both directions:
//! user assignments (`lr=0.01`) are decoded into typed values, and resolved
//! values are encoded back into arguments. `decode(encode(v)) == v` holds for
//! every literal value.

use crate::error::DecodeError;
use crate::param::ArgSplit;
use crate::value::{FlagFunction, ParamValue, Value};

/// Decodes user-supplied text into a typed value.
pub fn decode(text: &str) -> ParamValue {
    match FlagFunction::parse(text.trim()) {
        Some(function) => ParamValue::Deferred(function),
        None => ParamValue::Literal(decode_literal(text)),
    }
}

fn decode_literal(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Str(text.to_string());
    }
    if let Some(inner) = strip_quotes(trimmed) {
        return Value::Str(inner.to_string());
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "null" | "~" => return Value::Null,
        "true" | "yes" => return Value::Bool(true),
        "false" | "no" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Int(i);
    }
    if looks_numeric(trimmed) {
        if let Ok(f) = trimmed.parse::<f64>() {
            return Value::Float(f);
        }
    }
    if let Some(inner) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return Value::List(
            split_list_items(inner)
                .iter()
                .map(|item| decode_literal(item))
                .collect(),
        );
    }
    Value::Str(text.to_string())
}

fn strip_quotes(s: &str) -> Option<&str> {
    if s.len() < 2 {
        return None;
    }
    for quote in ['\'', '"'] {
        if s.starts_with(quote) && s.ends_with(quote) {
            return Some(&s[1..s.len() - 1]);
        }
    }
    None
}

// Rejects `inf`, `nan` and friends, which `f64::from_str` accepts.
fn looks_numeric(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit())
        && s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
}

fn split_list_items(inner: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in inner.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '[') => {
                depth += 1;
                current.push(c);
            }
            (None, ']') => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            (None, ',') if depth == 0 => {
                items.push(std::mem::take(&mut current));
            }
            (None, c) => current.push(c),
        }
    }
    if !current.trim().is_empty() || !items.is_empty() {
        items.push(current);
    }
    items.into_iter().map(|s| s.trim().to_string()).collect()
}

/// Encodes a literal value so that [`decode`] yields it back.
pub fn encode(value: &Value) -> String {
    encode_with(value, false)
}

pub fn encode_param(value: &ParamValue) -> String {
    match value {
        ParamValue::Literal(v) => encode(v),
        ParamValue::Deferred(f) => f.to_string(),
    }
}

fn encode_with(value: &Value, in_list: bool) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format!("{:?}", f),
        Value::Str(s) => encode_str(s, in_list),
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(|v| encode_with(v, true)).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

fn encode_str(s: &str, in_list: bool) -> String {
    let ambiguous = match decode(s) {
        ParamValue::Literal(Value::Str(decoded)) => decoded != s,
        _ => true,
    };
    let list_unsafe = in_list && s.contains([',', '[', ']']);
    if !ambiguous && !list_unsafe && !(in_list && s.trim() != s) {
        return s.to_string();
    }
    if s.contains('\'') {
        format!("\"{}\"", s)
    } else {
        format!("'{}'", s)
    }
}

/// Splits the encoded form of a multi-value parameter into decoded parts.
pub fn split_encoded(text: &str, split: &ArgSplit) -> Result<Vec<ParamValue>, DecodeError> {
    let parts = match split {
        ArgSplit::Whitespace => split_cmd(text)?,
        ArgSplit::Delimiter(delim) => text
            .split(delim.as_str())
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
    };
    Ok(parts.iter().map(|part| decode(part)).collect())
}

/// Joins values into the encoded form of a multi-value parameter.
pub fn join_encoded(values: &[ParamValue], split: &ArgSplit) -> String {
    match split {
        ArgSplit::Whitespace => values
            .iter()
            .map(|v| quote_arg(&encode_param(v)))
            .collect::<Vec<_>>()
            .join(" "),
        ArgSplit::Delimiter(delim) => values
            .iter()
            .map(encode_param)
            .collect::<Vec<_>>()
            .join(delim),
    }
}

/// Splits a command line into tokens using shell quoting rules.
///
/// Supports single quotes, double quotes (with `\"`, `\\` and `\$` escapes)
/// and backslash escapes outside quotes. No variable or glob expansion.
pub fn split_cmd(text: &str) -> Result<Vec<String>, DecodeError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(DecodeError::UnterminatedQuote(text.to_string())),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.peek() {
                            Some(&next @ ('"' | '\\' | '$')) => {
                                current.push(next);
                                chars.next();
                            }
                            _ => current.push('\\'),
                        },
                        Some(c) => current.push(c),
                        None => return Err(DecodeError::UnterminatedQuote(text.to_string())),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(next) => current.push(next),
                    None => return Err(DecodeError::TrailingEscape(text.to_string())),
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Quotes `arg` for a shell when it contains anything beyond safe characters.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,[]".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}
